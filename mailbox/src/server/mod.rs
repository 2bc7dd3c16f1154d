use std::collections::BTreeMap;

use tracing::{debug, info};

use super::errors::{MailboxError, Result};
use super::handshake::Handshake;
use super::line_source::LineSource;

#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct ServerStats {
    pub cycles: u64,
    /// Requests served per requesting process id.
    pub per_client: BTreeMap<libc::pid_t, u64>,
}

pub struct ServerWorker<'a> {
    handshake: Handshake<'a>,
    source: &'a dyn LineSource,
    total_requests: u64,
}

impl<'a> ServerWorker<'a> {
    /// `total_requests` is known up front: clients × requests per client.
    pub fn new(handshake: Handshake<'a>, source: &'a dyn LineSource, total_requests: u64) -> ServerWorker<'a> {
        ServerWorker {
            handshake,
            source,
            total_requests,
        }
    }

    pub fn run(&mut self) -> Result<ServerStats> {
        let mut stats = ServerStats::default();
        while stats.cycles < self.total_requests {
            let request = self.handshake.next_request()?;
            let line_number = request.line_number();
            let pid = request.process_id();
            let line = self
                .source
                .line(line_number as usize)?
                .ok_or_else(|| {
                    MailboxError::Protocol(format!(
                        "client {} requested line {} of a {} line document",
                        pid,
                        line_number,
                        self.source.line_count()
                    ))
                })?;
            info!("Server delivering line {} to client {}", line_number, pid);
            let served = request.respond(&line)?;
            stats.cycles += 1;
            *stats.per_client.entry(pid).or_insert(0) += 1;
            debug!(cycle = served, "response posted");
        }
        Ok(stats)
    }
}
