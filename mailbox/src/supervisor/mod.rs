//! Process group supervisor: owns the shared regions, forks the clients,
//! runs the server in the parent and reclaims everything once every child
//! has been reaped.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, error, info, warn};

use super::client::{client_seed, ClientConfig, ClientWorker};
use super::core::{ClientStats, MailboxConfig, MailboxRegion, ResultsTable};
use super::errors::{MailboxError, Result};
use super::handshake::{Handshake, Response, SemaphoreId};
use super::line_source::LineSource;
use super::server::{ServerStats, ServerWorker};

/// Exit status of a client that failed inside the worker loop.
pub const CLIENT_FAILURE_EXIT: i32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub client_count: u32,
    pub requests_per_client: u32,
    /// Session seed; per-client seeds derive from it. Random when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub shmem: MailboxConfig,
}

impl SessionConfig {
    pub fn new(client_count: u32, requests_per_client: u32) -> SessionConfig {
        SessionConfig {
            client_count,
            requests_per_client,
            seed: None,
            shmem: MailboxConfig::default(),
        }
    }

    pub fn total_requests(&self) -> u64 {
        u64::from(self.client_count) * u64::from(self.requests_per_client)
    }

    fn validate(&self) -> Result<()> {
        if self.client_count == 0 {
            return Err(MailboxError::InvalidConfig(
                "client count must be at least 1".to_string(),
            ));
        }
        if self.requests_per_client == 0 {
            return Err(MailboxError::InvalidConfig(
                "requests per client must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a child process ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    Signaled(i32),
    Unknown(i32),
}

impl TerminationReason {
    fn from_status(status: libc::c_int) -> TerminationReason {
        if libc::WIFEXITED(status) {
            TerminationReason::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            TerminationReason::Signaled(libc::WTERMSIG(status))
        } else {
            TerminationReason::Unknown(status)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminationReason::Exited(0))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Exited(code) => write!(f, "exited with code {}", code),
            TerminationReason::Signaled(sig) => write!(f, "killed by signal {}", sig),
            TerminationReason::Unknown(status) => write!(f, "ended with wait status {}", status),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientReport {
    pub index: usize,
    pub process_id: libc::pid_t,
    pub requests: u32,
    pub mean_wait: Duration,
    pub termination: TerminationReason,
}

#[derive(Clone, Debug)]
pub struct SessionReport {
    /// Cycles counted by the mailbox itself.
    pub cycles_served: u64,
    pub server: ServerStats,
    pub clients: Vec<ClientReport>,
}

fn wait_child(pid: libc::pid_t, flags: libc::c_int) -> Result<Option<TerminationReason>> {
    let mut status: libc::c_int = 0;
    loop {
        match unsafe { libc::waitpid(pid, &mut status, flags) } {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(MailboxError::Wait { pid, source: err });
                }
            }
            0 => return Ok(None),
            _ => return Ok(Some(TerminationReason::from_status(status))),
        }
    }
}

struct Child {
    index: usize,
    pid: libc::pid_t,
    termination: Cell<Option<TerminationReason>>,
}

impl Child {
    fn record(&self, reason: TerminationReason) -> TerminationReason {
        debug!(client = self.pid, %reason, "client reaped");
        self.termination.set(Some(reason));
        reason
    }

    fn try_reap(&self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = self.termination.get() {
            return Ok(Some(reason));
        }
        Ok(wait_child(self.pid, libc::WNOHANG)?.map(|reason| self.record(reason)))
    }

    fn reap(&self) -> Result<TerminationReason> {
        if let Some(reason) = self.termination.get() {
            return Ok(reason);
        }
        loop {
            if let Some(reason) = wait_child(self.pid, 0)? {
                return Ok(self.record(reason));
            }
        }
    }

    /// A client has to exit cleanly and leave completed stats behind.
    fn verify(&self, reason: TerminationReason, stats: &ClientStats) -> Result<()> {
        if !reason.is_success() {
            return Err(MailboxError::ClientFailed {
                pid: self.pid,
                reason,
            });
        }
        if !stats.is_completed() {
            return Err(MailboxError::Protocol(format!(
                "client {} exited before finishing its requests",
                self.pid
            )));
        }
        Ok(())
    }

    fn kill(&self) {
        // A reaped pid may already belong to someone else.
        if self.termination.get().is_some() {
            return;
        }
        if unsafe { libc::kill(self.pid, libc::SIGKILL) } == -1 {
            warn!(
                client = self.pid,
                error = %io::Error::last_os_error(),
                "could not kill client"
            );
        }
    }
}

#[derive(Default)]
struct ClientSet {
    children: Vec<Child>,
}

impl ClientSet {
    fn push(&mut self, index: usize, pid: libc::pid_t) {
        self.children.push(Child {
            index,
            pid,
            termination: Cell::new(None),
        });
    }

    fn len(&self) -> usize {
        self.children.len()
    }

    /// Reaps clients that already ended. A client that ended badly, or
    /// without completing, is an error.
    fn check(&self, results: &ResultsTable) -> Result<()> {
        for child in &self.children {
            if child.termination.get().is_some() {
                continue;
            }
            if let Some(reason) = child.try_reap()? {
                child.verify(reason, &results.get(child.index)?)?;
            }
        }
        Ok(())
    }

    fn kill_running(&self) {
        self.children.iter().for_each(Child::kill);
    }

    fn reap_all(&self) -> Result<Vec<TerminationReason>> {
        self.children.iter().map(Child::reap).collect()
    }
}

pub struct Supervisor {
    cfg: SessionConfig,
}

impl Supervisor {
    pub fn new(cfg: SessionConfig) -> Supervisor {
        Supervisor { cfg }
    }

    pub fn run(&self, source: &dyn LineSource) -> Result<SessionReport> {
        self.run_with(source, |_| Ok(()))
    }

    /// Like `run`, with `on_response` called inside every client process for
    /// each response it receives. An error from it fails that client.
    pub fn run_with<F>(&self, source: &dyn LineSource, on_response: F) -> Result<SessionReport>
    where
        F: Fn(&Response) -> Result<()>,
    {
        self.cfg.validate()?;
        let line_count = source.line_count();
        if line_count == 0 {
            return Err(MailboxError::InvalidConfig(
                "document has no lines to request".to_string(),
            ));
        }

        let mut region = MailboxRegion::create(&self.cfg.shmem)?;
        let mut results = ResultsTable::create(&self.cfg.shmem, self.cfg.client_count as usize)?;
        let session_seed = self.cfg.seed.unwrap_or_else(rand::random);
        info!(
            clients = self.cfg.client_count,
            requests_per_client = self.cfg.requests_per_client,
            lines = line_count,
            seed = session_seed,
            os_id = region.os_id(),
            "session starting"
        );

        let mut children = ClientSet::default();
        for index in 0..self.cfg.client_count as usize {
            match unsafe { libc::fork() } {
                -1 => {
                    let err = io::Error::last_os_error();
                    error!(error = %err, spawned = children.len(), "fork failed, aborting session");
                    children.kill_running();
                    children.reap_all()?;
                    region.destroy()?;
                    return Err(MailboxError::Fork(err));
                }
                0 => {
                    region.relinquish();
                    results.relinquish();
                    let cfg = ClientConfig {
                        index,
                        process_id: process::id() as libc::pid_t,
                        requests: self.cfg.requests_per_client,
                        line_count,
                        seed: client_seed(session_seed, index),
                    };
                    let code = match run_client(&region, &results, cfg, &on_response) {
                        Ok(_) => 0,
                        Err(e) => {
                            error!(client = cfg.process_id, error = %e, "client failed");
                            CLIENT_FAILURE_EXIT
                        }
                    };
                    process::exit(code);
                }
                pid => {
                    debug!(client = pid, index, "client spawned");
                    children.push(index, pid);
                }
            }
        }

        let server = self.serve(&region, &results, source, &children);
        if let Err(e) = &server {
            error!(error = %e, "server failed, terminating clients");
            children.kill_running();
        }
        let reasons = match children.reap_all() {
            Ok(reasons) => reasons,
            Err(e) => {
                error!(error = %e, "reaping failed, terminating clients");
                children.kill_running();
                return Err(e);
            }
        };
        let cycles_served = region.mailbox().cycles_served();
        let stats = results.snapshot();
        region.destroy()?;
        drop(results);

        let server = server?;
        for (child, reason) in children.children.iter().zip(&reasons) {
            child.verify(*reason, &stats[child.index])?;
        }

        let clients = children
            .children
            .iter()
            .zip(reasons)
            .map(|(child, termination)| client_report(child, &stats[child.index], termination))
            .collect();
        info!(cycles = cycles_served, "session finished");
        Ok(SessionReport {
            cycles_served,
            server,
            clients,
        })
    }

    /// Runs the server until every request is served. Waits give up on
    /// SIGINT/SIGTERM or as soon as a client is found dead.
    fn serve(
        &self,
        region: &MailboxRegion,
        results: &ResultsTable,
        source: &dyn LineSource,
        clients: &ClientSet,
    ) -> Result<ServerStats> {
        let interrupt = Arc::new(AtomicBool::new(false));
        let mut registered = Vec::with_capacity(2);
        for signal in [SIGINT, SIGTERM] {
            match signal_hook::flag::register(signal, Arc::clone(&interrupt)) {
                Ok(id) => registered.push(id),
                Err(e) => {
                    for id in registered {
                        signal_hook::low_level::unregister(id);
                    }
                    return Err(MailboxError::Signal(e));
                }
            }
        }
        let poll = |id: SemaphoreId| -> Result<()> {
            if interrupt.load(Ordering::Relaxed) {
                return Err(MailboxError::Interrupted(id));
            }
            clients.check(results)
        };
        let handshake = Handshake::new(region.mailbox()).with_poll(&poll);
        let served = ServerWorker::new(handshake, source, self.cfg.total_requests()).run();
        for id in registered {
            signal_hook::low_level::unregister(id);
        }
        served
    }
}

fn run_client<F>(
    region: &MailboxRegion,
    results: &ResultsTable,
    cfg: ClientConfig,
    on_response: &F,
) -> Result<ClientStats>
where
    F: Fn(&Response) -> Result<()>,
{
    let mut worker = ClientWorker::new(Handshake::new(region.mailbox()), results, cfg)?;
    worker.run(on_response)
}

fn client_report(child: &Child, stats: &ClientStats, termination: TerminationReason) -> ClientReport {
    ClientReport {
        index: child.index,
        process_id: child.pid,
        requests: stats.requests_issued,
        mean_wait: stats.mean_wait(),
        termination,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_reasons_are_classified() {
        // Encodings follow the Linux wait status layout.
        assert_eq!(TerminationReason::from_status(0), TerminationReason::Exited(0));
        assert_eq!(TerminationReason::from_status(3 << 8), TerminationReason::Exited(3));
        assert_eq!(TerminationReason::from_status(libc::SIGKILL), TerminationReason::Signaled(libc::SIGKILL));
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Signaled(9).is_success());
        assert_eq!(TerminationReason::Exited(1).to_string(), "exited with code 1");
    }

    #[test]
    fn zero_counts_are_rejected_before_anything_is_created() {
        let source = crate::line_source::IndexedLineSource::from_bytes(b"a\n".to_vec());
        for cfg in [SessionConfig::new(0, 1), SessionConfig::new(1, 0)] {
            assert!(matches!(
                Supervisor::new(cfg).run(&source),
                Err(MailboxError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn empty_document_is_rejected() {
        let source = crate::line_source::IndexedLineSource::from_bytes(Vec::new());
        assert!(matches!(
            Supervisor::new(SessionConfig::new(1, 1)).run(&source),
            Err(MailboxError::InvalidConfig(_))
        ));
    }

    #[test]
    fn total_requests_does_not_overflow() {
        assert_eq!(SessionConfig::new(u32::MAX, 2).total_requests(), u64::from(u32::MAX) * 2);
    }
}
