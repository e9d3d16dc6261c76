//! Generated gRPC bindings for the master's task-distribution service.

tonic::include_proto!("mapreduce");
