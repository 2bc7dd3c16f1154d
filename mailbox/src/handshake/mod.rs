//! Three-semaphore handshake guarding the mailbox.
//!
//! One request cycle walks `Idle → ClientHolds → RequestPosted → ServerHolds
//! → ResponsePosted → Idle`:
//!
//! ```text
//!   client                                   server
//!   wait(mutual_exclusion)   -> ExclusivePermit
//!   write request
//!   post(request_ready)      ---------------> wait(request_ready) -> PendingRequest
//!                                             resolve, write response
//!   wait(response_ready)     <--------------- post(response_ready)
//!   read response
//!   post(mutual_exclusion)
//! ```
//!
//! The slot is only reachable through `ExclusivePermit` (client side) and
//! `PendingRequest` (server side), so holding one of them is holding the slot.

use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;

use tracing::{error, trace};

use super::core::{copy_into_slot, Mailbox, Slot};
use super::errors::{MailboxError, Result};

/// How often a polling wait runs its hook.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Called before every slice of a polling wait; an error ends the wait.
pub type PollHook<'a> = &'a dyn Fn(SemaphoreId) -> Result<()>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SemaphoreId {
    MutualExclusion,
    RequestReady,
    ResponseReady,
}

impl SemaphoreId {
    pub const ALL: [SemaphoreId; 3] = [
        SemaphoreId::MutualExclusion,
        SemaphoreId::RequestReady,
        SemaphoreId::ResponseReady,
    ];
}

impl fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemaphoreId::MutualExclusion => write!(f, "mutual_exclusion"),
            SemaphoreId::RequestReady => write!(f, "request_ready"),
            SemaphoreId::ResponseReady => write!(f, "response_ready"),
        }
    }
}

/// Process-shared counting semaphore living inside a shared region.
#[repr(transparent)]
pub struct Semaphore {
    inner: UnsafeCell<MaybeUninit<libc::sem_t>>,
}

unsafe impl Sync for Semaphore {}

impl Semaphore {
    fn as_ptr(&self) -> *mut libc::sem_t {
        self.inner.get() as *mut libc::sem_t
    }

    /// # Safety
    /// Must be called once, before any other process or thread can see the semaphore.
    pub(crate) unsafe fn init(&self, id: SemaphoreId, value: u32) -> Result<()> {
        if libc::sem_init(self.as_ptr(), 1, value) == -1 {
            return Err(MailboxError::semaphore("init", id));
        }
        Ok(())
    }

    /// # Safety
    /// No process or thread may be blocked on, or later use, the semaphore.
    pub(crate) unsafe fn destroy(&self, id: SemaphoreId) -> Result<()> {
        if libc::sem_destroy(self.as_ptr()) == -1 {
            return Err(MailboxError::Teardown {
                id,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub fn post(&self, id: SemaphoreId) -> Result<()> {
        if unsafe { libc::sem_post(self.as_ptr()) } == -1 {
            return Err(MailboxError::semaphore("post", id));
        }
        Ok(())
    }

    /// Blocks until the count is positive. `EINTR` is retried.
    pub fn wait(&self, id: SemaphoreId) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(MailboxError::Semaphore {
                    op: "wait",
                    id,
                    source: err,
                });
            }
        }
    }

    /// Like `wait`, but runs `poll` every `WAIT_POLL_INTERVAL` and gives up
    /// with its error.
    pub fn wait_polling(&self, id: SemaphoreId, poll: PollHook<'_>) -> Result<()> {
        loop {
            poll(id)?;
            let deadline = realtime_deadline(WAIT_POLL_INTERVAL)
                .map_err(|source| MailboxError::Semaphore { op: "wait", id, source })?;
            if unsafe { libc::sem_timedwait(self.as_ptr(), &deadline) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) | Some(libc::EINTR) => continue,
                _ => {
                    return Err(MailboxError::Semaphore {
                        op: "wait",
                        id,
                        source: err,
                    })
                }
            }
        }
    }

    /// Takes a permit if one is available.
    pub fn try_wait(&self, id: SemaphoreId) -> Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(MailboxError::Semaphore {
                        op: "trywait",
                        id,
                        source: err,
                    })
                }
            }
        }
    }
}

fn realtime_deadline(after: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let nanos = now.tv_nsec as i64 + i64::from(after.subsec_nanos());
    now.tv_sec += after.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t;
    now.tv_nsec = (nanos % 1_000_000_000) as _;
    Ok(now)
}

/// Process-local view of the handshake over a shared mailbox.
#[derive(Clone, Copy)]
pub struct Handshake<'a> {
    mailbox: &'a Mailbox,
    poll: Option<PollHook<'a>>,
}

impl<'a> Handshake<'a> {
    pub fn new(mailbox: &'a Mailbox) -> Handshake<'a> {
        Handshake {
            mailbox,
            poll: None,
        }
    }

    /// Waits made through this handshake run `poll` periodically and fail with its error.
    pub fn with_poll(mut self, poll: PollHook<'a>) -> Handshake<'a> {
        self.poll = Some(poll);
        self
    }

    pub fn mailbox(&self) -> &'a Mailbox {
        self.mailbox
    }

    fn wait(&self, id: SemaphoreId) -> Result<()> {
        let sem = self.mailbox.semaphore(id);
        match self.poll {
            Some(poll) => sem.wait_polling(id, poll),
            None => sem.wait(id),
        }
    }

    fn post(&self, id: SemaphoreId) -> Result<()> {
        self.mailbox.semaphore(id).post(id)
    }

    /// `Idle → ClientHolds`.
    pub fn acquire_exclusive(&self) -> Result<ExclusivePermit<'_, 'a>> {
        self.wait(SemaphoreId::MutualExclusion)?;
        trace!("mutual_exclusion acquired");
        Ok(ExclusivePermit {
            handshake: self,
            released: false,
        })
    }

    /// `RequestPosted → ServerHolds`.
    pub fn next_request(&self) -> Result<PendingRequest<'_, 'a>> {
        self.wait(SemaphoreId::RequestReady)?;
        let slot = unsafe { *self.mailbox.slot() };
        trace!(
            line_number = slot.requested_line_number,
            process_id = slot.requesting_process_id,
            "request taken"
        );
        Ok(PendingRequest {
            handshake: self,
            line_number: slot.requested_line_number,
            process_id: slot.requesting_process_id,
        })
    }
}

/// What a client reads back at the end of a cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub process_id: libc::pid_t,
    pub line_number: u32,
    pub text: Vec<u8>,
}

impl Response {
    pub fn text_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.text)
    }
}

/// Scoped hold on `mutual_exclusion`. Posts the semaphore on drop unless
/// released explicitly.
pub struct ExclusivePermit<'h, 'a> {
    handshake: &'h Handshake<'a>,
    released: bool,
}

impl<'h, 'a> ExclusivePermit<'h, 'a> {
    /// `ClientHolds → RequestPosted → … → ResponsePosted`, then reads the response.
    pub fn request(&mut self, process_id: libc::pid_t, line_number: u32) -> Result<Response> {
        let mailbox = self.handshake.mailbox;
        unsafe {
            let slot = mailbox.slot();
            (*slot).requesting_process_id = process_id;
            (*slot).requested_line_number = line_number;
            (*slot).requested_line_len = 0;
        }
        self.handshake.post(SemaphoreId::RequestReady)?;
        self.handshake.wait(SemaphoreId::ResponseReady)?;

        let slot: Slot = unsafe { *mailbox.slot() };
        if slot.requesting_process_id != process_id || slot.requested_line_number != line_number {
            return Err(MailboxError::Protocol(format!(
                "client {} asked for line {} but the mailbox holds line {} for client {}",
                process_id,
                line_number,
                slot.requested_line_number,
                slot.requesting_process_id
            )));
        }
        Ok(Response {
            process_id,
            line_number,
            text: slot.text().to_vec(),
        })
    }

    /// `ResponsePosted → Idle`.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.handshake.post(SemaphoreId::MutualExclusion)
    }
}

impl Drop for ExclusivePermit<'_, '_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.handshake.post(SemaphoreId::MutualExclusion) {
                error!(error = %e, "failed to release mutual_exclusion");
            }
        }
    }
}

/// A request the server has taken out of the mailbox and must answer.
pub struct PendingRequest<'h, 'a> {
    handshake: &'h Handshake<'a>,
    line_number: u32,
    process_id: libc::pid_t,
}

impl PendingRequest<'_, '_> {
    pub fn line_number(&self) -> u32 {
        self.line_number
    }

    pub fn process_id(&self) -> libc::pid_t {
        self.process_id
    }

    /// `ServerHolds → ResponsePosted`. Returns the total cycles served so far.
    pub fn respond(self, text: &[u8]) -> Result<u64> {
        let mailbox = self.handshake.mailbox;
        unsafe { copy_into_slot(&mut *mailbox.slot(), text) };
        let cycles = mailbox.record_cycle();
        self.handshake.post(SemaphoreId::ResponseReady)?;
        Ok(cycles)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::thread;

    use super::*;
    use crate::core::{MailboxConfig, MailboxRegion, LINE_SIZE};

    #[test]
    fn semaphore_counts_posts() -> Result<()> {
        let region = MailboxRegion::create(&MailboxConfig::default())?;
        let sem = region.mailbox().semaphore(SemaphoreId::RequestReady);
        sem.post(SemaphoreId::RequestReady)?;
        sem.post(SemaphoreId::RequestReady)?;
        assert!(sem.try_wait(SemaphoreId::RequestReady)?);
        sem.wait(SemaphoreId::RequestReady)?;
        assert!(!sem.try_wait(SemaphoreId::RequestReady)?);
        region.destroy()
    }

    #[test]
    fn permit_releases_on_drop() -> Result<()> {
        let region = MailboxRegion::create(&MailboxConfig::default())?;
        let handshake = Handshake::new(region.mailbox());
        {
            let _permit = handshake.acquire_exclusive()?;
            let sem = region.mailbox().semaphore(SemaphoreId::MutualExclusion);
            assert!(!sem.try_wait(SemaphoreId::MutualExclusion)?);
        }
        let permit = handshake.acquire_exclusive()?;
        permit.release()?;
        region.destroy()
    }

    #[test]
    fn interrupted_wait_gives_up() -> Result<()> {
        let region = MailboxRegion::create(&MailboxConfig::default())?;
        let flag = AtomicBool::new(false);
        let polls = AtomicU32::new(0);
        let poll = |id: SemaphoreId| -> Result<()> {
            polls.fetch_add(1, Ordering::SeqCst);
            if flag.load(Ordering::SeqCst) {
                return Err(MailboxError::Interrupted(id));
            }
            Ok(())
        };
        let handshake = Handshake::new(region.mailbox()).with_poll(&poll);
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                flag.store(true, Ordering::SeqCst);
            });
            match handshake.next_request() {
                Err(MailboxError::Interrupted(SemaphoreId::RequestReady)) => {}
                Err(e) => panic!("unexpected error: {}", e),
                Ok(_) => panic!("request appeared out of nowhere"),
            }
        });
        assert!(polls.load(Ordering::SeqCst) >= 1);
        region.destroy()
    }

    #[test]
    fn one_cycle_moves_request_and_response() -> Result<()> {
        let region = MailboxRegion::create(&MailboxConfig::default())?;
        let mailbox = region.mailbox();
        let long_line = vec![b'a'; LINE_SIZE + 20];
        let response = thread::scope(|s| -> Result<Response> {
            let server = s.spawn(|| -> Result<(u32, libc::pid_t)> {
                let handshake = Handshake::new(mailbox);
                let request = handshake.next_request()?;
                let seen = (request.line_number(), request.process_id());
                request.respond(&long_line)?;
                Ok(seen)
            });
            let handshake = Handshake::new(mailbox);
            let mut permit = handshake.acquire_exclusive()?;
            let response = permit.request(7, 3)?;
            permit.release()?;
            assert_eq!(server.join().expect("server thread panicked")?, (3, 7));
            Ok(response)
        })?;
        assert_eq!(response.line_number, 3);
        assert_eq!(response.text, vec![b'a'; LINE_SIZE]);
        assert_eq!(mailbox.cycles_served(), 1);
        region.destroy()
    }

    #[test]
    fn only_one_permit_holder_at_a_time() -> Result<()> {
        let region = MailboxRegion::create(&MailboxConfig::default())?;
        let mailbox = region.mailbox();
        let holders = AtomicU32::new(0);
        let overlaps = AtomicU32::new(0);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| -> Result<()> {
                    let handshake = Handshake::new(mailbox);
                    for _ in 0..200 {
                        let permit = handshake.acquire_exclusive()?;
                        if holders.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::yield_now();
                        holders.fetch_sub(1, Ordering::SeqCst);
                        permit.release()?;
                    }
                    Ok(())
                });
            }
        });
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        region.destroy()
    }
}
