//! The master's authoritative task state and the single-writer actor that
//! owns it.
//!
//! Every RPC handler sends one message into the actor's mailbox and blocks
//! on a reply channel; the actor consumes messages serially, so checking a
//! task and marking it distributed happen atomically and no two workers can
//! receive the same task. The map-before-reduce barrier, completion
//! detection, and the final merge all live inside single messages.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::relation;
use crate::rpc::{
    self,
    map_reduce_server::{MapReduce, MapReduceServer},
};
use crate::task::{self, MapTask, ReduceTask};

/// Name of the merged result relation under the master's data root.
pub const FINAL_OUTPUT: &str = "finalOutput.db";

const MAILBOX_DEPTH: usize = 32;

/// Task state, created at master start and mutated only by the actor.
pub struct Tasks {
    pub map_tasks: Vec<MapTask>,
    pub reduce_tasks: Vec<ReduceTask>,
    pub alive_workers: u32,
    pub finished: bool,
}

impl Tasks {
    /// Fresh state: M map tasks sourced from the master's file server and
    /// R reduce tasks with empty source slots.
    pub fn new(m: u32, r: u32, master_host: &str, master_http_port: u16) -> Self {
        Self {
            map_tasks: (0..m)
                .map(|n| MapTask::new(m, r, n, master_host, master_http_port))
                .collect(),
            reduce_tasks: (0..r).map(|n| ReduceTask::new(m, r, n)).collect(),
            alive_workers: 0,
            finished: false,
        }
    }
}

/// What `GetTask` hands a worker.
#[derive(Clone, Debug)]
pub enum Assignment {
    Map(MapTask),
    Reduce(ReduceTask),
    /// Nothing available right now; poll again.
    Idle,
}

/// Where the actor writes the final merge.
pub struct MergeTarget {
    pub data_root: PathBuf,
    pub http_port: u16,
}

enum Command {
    Ping {
        reply: oneshot::Sender<()>,
    },
    GetTask {
        reply: oneshot::Sender<Assignment>,
    },
    MapFinished {
        task_n: u32,
        address: String,
        port: u16,
        reply: oneshot::Sender<()>,
    },
    ReduceFinished {
        task_n: u32,
        address: String,
        port: u16,
        reply: oneshot::Sender<()>,
    },
    TaskFailed {
        task_n: u32,
        is_map: bool,
        error: String,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<bool>,
    },
}

/// Handle for enqueueing messages to the actor.
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::Sender<Command>,
}

impl Coordinator {
    /// Spawn the actor owning `tasks`. One sentinel is sent on `fin_tx`
    /// after the final merge completes.
    pub fn spawn(tasks: Tasks, target: MergeTarget, fin_tx: mpsc::Sender<()>) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        tokio::spawn(run_actor(tasks, target, fin_tx, rx));
        Self { tx }
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(|reply| Command::Ping { reply }).await
    }

    pub async fn get_task(&self) -> Result<Assignment> {
        self.call(|reply| Command::GetTask { reply }).await
    }

    pub async fn map_finished(&self, task_n: u32, address: String, port: u16) -> Result<()> {
        self.call(|reply| Command::MapFinished {
            task_n,
            address,
            port,
            reply,
        })
        .await
    }

    pub async fn reduce_finished(&self, task_n: u32, address: String, port: u16) -> Result<()> {
        self.call(|reply| Command::ReduceFinished {
            task_n,
            address,
            port,
            reply,
        })
        .await
    }

    pub async fn task_failed(&self, task_n: u32, is_map: bool, error: String) -> Result<()> {
        self.call(|reply| Command::TaskFailed {
            task_n,
            is_map,
            error,
            reply,
        })
        .await
    }

    /// Returns true once the whole job is finished; each true reply
    /// releases one worker.
    pub async fn shutdown_request(&self) -> Result<bool> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| anyhow!("coordinator actor is gone"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("coordinator actor dropped the reply"))
    }
}

async fn run_actor(
    mut tasks: Tasks,
    target: MergeTarget,
    fin_tx: mpsc::Sender<()>,
    mut rx: mpsc::Receiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Ping { reply } => {
                tasks.alive_workers += 1;
                info!(alive_workers = tasks.alive_workers, "pinged by new worker");
                let _ = reply.send(());
            }
            Command::GetTask { reply } => {
                let _ = reply.send(next_assignment(&mut tasks));
            }
            Command::MapFinished {
                task_n,
                address,
                port,
                reply,
            } => {
                record_map_finished(&mut tasks, task_n, address, port);
                let _ = reply.send(());
            }
            Command::ReduceFinished {
                task_n,
                address,
                port,
                reply,
            } => {
                record_reduce_finished(&mut tasks, task_n, address, port);
                if !tasks.finished && tasks.reduce_tasks.iter().all(|t| t.finished) {
                    // The merge runs inside this message on purpose: no
                    // other RPC can observe `finished` until the final
                    // output exists.
                    if let Err(err) = merge_final_output(&tasks, &target).await {
                        error!(error = %err, "final merge failed");
                    }
                    tasks.finished = true;
                    let _ = fin_tx.send(()).await;
                }
                let _ = reply.send(());
            }
            Command::TaskFailed {
                task_n,
                is_map,
                error,
                reply,
            } => {
                release_failed_task(&mut tasks, task_n, is_map, &error);
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                let ok = tasks.finished;
                if ok {
                    tasks.alive_workers = tasks.alive_workers.saturating_sub(1);
                }
                let _ = reply.send(ok);
            }
        }
    }
}

/// Hand out at most one undistributed task, lowest index first and maps
/// before reduces. Reduce tasks stay unassignable until every map task
/// has finished.
fn next_assignment(tasks: &mut Tasks) -> Assignment {
    if let Some(map_task) = tasks.map_tasks.iter_mut().find(|t| !t.distributed) {
        map_task.distributed = true;
        return Assignment::Map(map_task.clone());
    }
    if tasks.map_tasks.iter().all(|t| t.finished) {
        if let Some(reduce_task) = tasks.reduce_tasks.iter_mut().find(|t| !t.distributed) {
            reduce_task.distributed = true;
            return Assignment::Reduce(reduce_task.clone());
        }
    }
    Assignment::Idle
}

/// Mark map task `task_n` finished and broadcast the hosting worker into
/// slot `task_n` of every reduce task. Redelivery writes the same values
/// again, so the message is idempotent.
fn record_map_finished(tasks: &mut Tasks, task_n: u32, address: String, port: u16) {
    info!(task = task_n, worker = %address, "map task finished");
    tasks.map_tasks[task_n as usize].finished = true;
    for reduce_task in &mut tasks.reduce_tasks {
        reduce_task.source_hosts[task_n as usize] = address.clone();
        reduce_task.source_ports[task_n as usize] = port;
    }
}

fn record_reduce_finished(tasks: &mut Tasks, task_n: u32, address: String, port: u16) {
    info!(task = task_n, worker = %address, "reduce task finished");
    let reduce_task = &mut tasks.reduce_tasks[task_n as usize];
    reduce_task.finished = true;
    reduce_task.finished_by = address;
    reduce_task.finished_by_port = port;
}

/// A worker could not complete the task; clear `distributed` (unless a
/// redundant delivery already finished it) so `GetTask` can reissue.
fn release_failed_task(tasks: &mut Tasks, task_n: u32, is_map: bool, error: &str) {
    warn!(task = task_n, is_map, error, "task failed, releasing for reissue");
    if is_map {
        let map_task = &mut tasks.map_tasks[task_n as usize];
        if !map_task.finished {
            map_task.distributed = false;
        }
    } else {
        let reduce_task = &mut tasks.reduce_tasks[task_n as usize];
        if !reduce_task.finished {
            reduce_task.distributed = false;
        }
    }
}

async fn merge_final_output(tasks: &Tasks, target: &MergeTarget) -> Result<()> {
    let urls: Vec<String> = tasks
        .reduce_tasks
        .iter()
        .map(|t| {
            task::make_url(
                &t.finished_by,
                t.finished_by_port,
                &task::reduce_output_file(t.n),
            )
        })
        .collect();
    let dest = target.data_root.join(FINAL_OUTPUT);
    let scratch = target
        .data_root
        .join(task::temp_dir(target.http_port))
        .join("finalOutput_temp.db");
    relation::merge(&urls, &dest, &scratch).await?;
    info!(path = %dest.display(), "final output merged");
    Ok(())
}

/////////////////////////////////////////////////////////////////////////////
// gRPC surface
/////////////////////////////////////////////////////////////////////////////

/// The tonic service workers talk to; every handler is a thin shim over
/// one actor message.
pub struct MapReduceService {
    coordinator: Coordinator,
    m: u32,
    r: u32,
}

impl MapReduceService {
    pub fn new(coordinator: Coordinator, m: u32, r: u32) -> Self {
        Self { coordinator, m, r }
    }

    pub fn into_server(self) -> MapReduceServer<Self> {
        MapReduceServer::new(self)
    }

    fn check_task_n(&self, task_n: u32, is_map: bool) -> Result<(), Status> {
        let bound = if is_map { self.m } else { self.r };
        if task_n >= bound {
            return Err(Status::invalid_argument(format!(
                "task index {task_n} out of range (bound {bound})"
            )));
        }
        Ok(())
    }
}

fn actor_gone(err: anyhow::Error) -> Status {
    Status::internal(err.to_string())
}

fn notified_port(port: u32) -> Result<u16, Status> {
    u16::try_from(port).map_err(|_| Status::invalid_argument("port out of range"))
}

#[tonic::async_trait]
impl MapReduce for MapReduceService {
    async fn ping(&self, _request: Request<rpc::Empty>) -> Result<Response<rpc::Empty>, Status> {
        self.coordinator.ping().await.map_err(actor_gone)?;
        Ok(Response::new(rpc::Empty {}))
    }

    async fn get_task(
        &self,
        _request: Request<rpc::Empty>,
    ) -> Result<Response<rpc::TaskReply>, Status> {
        let assignment = self.coordinator.get_task().await.map_err(actor_gone)?;
        let reply = match assignment {
            Assignment::Map(map_task) => rpc::TaskReply {
                got_a_task: true,
                is_map: true,
                map_task: Some((&map_task).into()),
                reduce_task: None,
            },
            Assignment::Reduce(reduce_task) => rpc::TaskReply {
                got_a_task: true,
                is_map: false,
                map_task: None,
                reduce_task: Some((&reduce_task).into()),
            },
            Assignment::Idle => rpc::TaskReply {
                got_a_task: false,
                is_map: false,
                map_task: None,
                reduce_task: None,
            },
        };
        Ok(Response::new(reply))
    }

    async fn notify_map_finished(
        &self,
        request: Request<rpc::Notification>,
    ) -> Result<Response<rpc::Empty>, Status> {
        let notification = request.into_inner();
        self.check_task_n(notification.task_n, true)?;
        let port = notified_port(notification.port)?;
        self.coordinator
            .map_finished(notification.task_n, notification.address, port)
            .await
            .map_err(actor_gone)?;
        Ok(Response::new(rpc::Empty {}))
    }

    async fn notify_reduce_finished(
        &self,
        request: Request<rpc::Notification>,
    ) -> Result<Response<rpc::Empty>, Status> {
        let notification = request.into_inner();
        self.check_task_n(notification.task_n, false)?;
        let port = notified_port(notification.port)?;
        self.coordinator
            .reduce_finished(notification.task_n, notification.address, port)
            .await
            .map_err(actor_gone)?;
        Ok(Response::new(rpc::Empty {}))
    }

    async fn notify_task_failed(
        &self,
        request: Request<rpc::FailureNotification>,
    ) -> Result<Response<rpc::Empty>, Status> {
        let notification = request.into_inner();
        self.check_task_n(notification.task_n, notification.is_map)?;
        self.coordinator
            .task_failed(notification.task_n, notification.is_map, notification.error)
            .await
            .map_err(actor_gone)?;
        Ok(Response::new(rpc::Empty {}))
    }

    async fn shutdown_request(
        &self,
        _request: Request<rpc::Empty>,
    ) -> Result<Response<rpc::ShutdownReply>, Status> {
        let ok = self
            .coordinator
            .shutdown_request()
            .await
            .map_err(actor_gone)?;
        Ok(Response::new(rpc::ShutdownReply { ok }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks_2x2() -> Tasks {
        Tasks::new(2, 2, "localhost", 3410)
    }

    fn finish_all_maps(tasks: &mut Tasks) {
        record_map_finished(tasks, 0, "w0".into(), 4000);
        record_map_finished(tasks, 1, "w1".into(), 4001);
    }

    #[test]
    fn maps_are_assigned_once_in_ascending_order() {
        let mut tasks = tasks_2x2();
        match next_assignment(&mut tasks) {
            Assignment::Map(t) => assert_eq!(t.n, 0),
            other => panic!("expected map 0, got {other:?}"),
        }
        match next_assignment(&mut tasks) {
            Assignment::Map(t) => assert_eq!(t.n, 1),
            other => panic!("expected map 1, got {other:?}"),
        }
        assert!(matches!(next_assignment(&mut tasks), Assignment::Idle));
    }

    #[test]
    fn reduces_wait_for_every_map_to_finish() {
        let mut tasks = tasks_2x2();
        next_assignment(&mut tasks);
        next_assignment(&mut tasks);

        record_map_finished(&mut tasks, 0, "w0".into(), 4000);
        // One map still running: barrier holds.
        assert!(matches!(next_assignment(&mut tasks), Assignment::Idle));

        record_map_finished(&mut tasks, 1, "w1".into(), 4001);
        match next_assignment(&mut tasks) {
            Assignment::Reduce(t) => {
                assert_eq!(t.n, 0);
                assert_eq!(t.source_hosts, vec!["w0", "w1"]);
                assert_eq!(t.source_ports, vec![4000, 4001]);
            }
            other => panic!("expected reduce 0, got {other:?}"),
        }
        match next_assignment(&mut tasks) {
            Assignment::Reduce(t) => assert_eq!(t.n, 1),
            other => panic!("expected reduce 1, got {other:?}"),
        }
        assert!(matches!(next_assignment(&mut tasks), Assignment::Idle));
    }

    #[test]
    fn map_finished_is_idempotent() {
        let mut tasks = tasks_2x2();
        next_assignment(&mut tasks);
        next_assignment(&mut tasks);
        finish_all_maps(&mut tasks);
        record_map_finished(&mut tasks, 0, "w0".into(), 4000);

        assert!(tasks.map_tasks[0].finished);
        for reduce_task in &tasks.reduce_tasks {
            assert_eq!(reduce_task.source_hosts, vec!["w0", "w1"]);
            assert_eq!(reduce_task.source_ports, vec![4000, 4001]);
        }
    }

    #[test]
    fn failed_tasks_are_reissued() {
        let mut tasks = tasks_2x2();
        next_assignment(&mut tasks);
        release_failed_task(&mut tasks, 0, true, "user map blew up");
        match next_assignment(&mut tasks) {
            Assignment::Map(t) => assert_eq!(t.n, 0),
            other => panic!("expected map 0 again, got {other:?}"),
        }
    }

    #[test]
    fn finished_tasks_ignore_late_failure_reports() {
        let mut tasks = tasks_2x2();
        next_assignment(&mut tasks);
        record_map_finished(&mut tasks, 0, "w0".into(), 4000);
        release_failed_task(&mut tasks, 0, true, "stale report");
        assert!(tasks.map_tasks[0].distributed);
        assert!(tasks.map_tasks[0].finished);
    }

    #[tokio::test]
    async fn actor_counts_workers_and_gates_shutdown() {
        let (fin_tx, _fin_rx) = mpsc::channel(1);
        let target = MergeTarget {
            data_root: std::env::temp_dir(),
            http_port: 0,
        };
        let coordinator = Coordinator::spawn(tasks_2x2(), target, fin_tx);

        coordinator.ping().await.unwrap();
        coordinator.ping().await.unwrap();
        assert!(!coordinator.shutdown_request().await.unwrap());

        // Two workers asking concurrently can never receive the same task.
        let (a, b) = tokio::join!(coordinator.get_task(), coordinator.get_task());
        match (a.unwrap(), b.unwrap()) {
            (Assignment::Map(x), Assignment::Map(y)) => assert_ne!(x.n, y.n),
            other => panic!("expected two distinct map tasks, got {other:?}"),
        }
    }
}
