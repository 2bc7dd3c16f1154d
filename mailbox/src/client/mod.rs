use std::convert::TryFrom;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::core::{ClientStats, ResultsTable};
use super::errors::{MailboxError, Result};
use super::handshake::{Handshake, Response};

#[derive(Copy, Clone, Debug)]
pub struct ClientConfig {
    /// Slot of this client in the results table.
    pub index: usize,
    /// Identifier written into the mailbox with every request.
    pub process_id: libc::pid_t,
    pub requests: u32,
    pub line_count: usize,
    pub seed: u64,
}

/// Uniform line numbers in `[1, line_count]`.
pub struct RequestSampler {
    rng: StdRng,
    line_count: u32,
}

impl RequestSampler {
    pub fn new(seed: u64, line_count: usize) -> Result<RequestSampler> {
        let line_count = u32::try_from(line_count)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                MailboxError::InvalidConfig(format!("cannot sample from {} lines", line_count))
            })?;
        Ok(RequestSampler {
            rng: StdRng::seed_from_u64(seed),
            line_count,
        })
    }

    pub fn next_line(&mut self) -> u32 {
        self.rng.gen_range(1..=self.line_count)
    }
}

/// Seed for the client at `index`, distinct per client for one session seed.
pub fn client_seed(session_seed: u64, index: usize) -> u64 {
    session_seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

pub struct ClientWorker<'a> {
    handshake: Handshake<'a>,
    results: &'a ResultsTable,
    sampler: RequestSampler,
    cfg: ClientConfig,
}

impl<'a> ClientWorker<'a> {
    pub fn new(
        handshake: Handshake<'a>,
        results: &'a ResultsTable,
        cfg: ClientConfig,
    ) -> Result<ClientWorker<'a>> {
        if cfg.index >= results.len() {
            return Err(MailboxError::InvalidConfig(format!(
                "client index {} out of range for {} clients",
                cfg.index,
                results.len()
            )));
        }
        Ok(ClientWorker {
            handshake,
            results,
            sampler: RequestSampler::new(cfg.seed, cfg.line_count)?,
            cfg,
        })
    }

    /// Runs every request cycle, handing each response to `on_response`
    /// while exclusivity is still held.
    pub fn run<F>(&mut self, mut on_response: F) -> Result<ClientStats>
    where
        F: FnMut(&Response) -> Result<()>,
    {
        let pid = self.cfg.process_id;
        let mut stats = ClientStats {
            process_id: pid,
            ..Default::default()
        };
        let mut waited = Duration::ZERO;
        for _ in 0..self.cfg.requests {
            let line_number = self.sampler.next_line();
            let mut permit = self.handshake.acquire_exclusive()?;
            let start = Instant::now();
            info!("Client {} requesting line {}", pid, line_number);
            let response = permit.request(pid, line_number)?;
            waited += start.elapsed();
            info!(
                "Client {} received line {}: {}",
                pid,
                line_number,
                response.text_lossy()
            );
            on_response(&response)?;
            stats.requests_issued += 1;
            permit.release()?;

            thread::yield_now();
        }
        stats.total_wait_nanos = waited.as_nanos() as u64;
        stats.completed = 1;
        self.results.record(self.cfg.index, stats)?;
        debug!(
            client = pid,
            requests = stats.requests_issued,
            mean_wait = ?stats.mean_wait(),
            "client finished"
        );
        Ok(stats)
    }
}
