use std::cell::UnsafeCell;
use std::mem;
use std::path::PathBuf;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use super::errors::{MailboxError, Result};
use super::handshake::{Semaphore, SemaphoreId};

/// Capacity of the response text field. Longer lines are cut at this many bytes.
pub const LINE_SIZE: usize = 100;

pub static SHMEM_LINK_PREFIX: &str = "linesrv";

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Directory receiving a link file per region. No link files when unset.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Base name of the link files, `linesrv-<pid>` when unset.
    #[serde(default)]
    pub link_name: Option<String>,
}

impl MailboxConfig {
    pub fn builder() -> MailboxConfigBuilder {
        MailboxConfigBuilder::default()
    }

    fn link_path(&self, suffix: &str) -> Option<PathBuf> {
        let dir = self.data_dir.as_ref()?;
        let name = match &self.link_name {
            Some(name) => name.clone(),
            None => format!("{}-{}", SHMEM_LINK_PREFIX, process::id()),
        };
        Some(PathBuf::from(dir).join(format!("{}.{}", name, suffix)))
    }
}

#[derive(Default)]
pub struct MailboxConfigBuilder {
    data_dir: Option<String>,
    link_name: Option<String>,
}

impl MailboxConfigBuilder {
    pub fn data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn link_name(mut self, link_name: impl Into<String>) -> Self {
        self.link_name = Some(link_name.into());
        self
    }

    pub fn build(self) -> Result<MailboxConfig> {
        if let Some(name) = &self.link_name {
            if name.is_empty() || name.contains('/') {
                return Err(MailboxError::InvalidConfig(format!(
                    "link name '{}' must be a non-empty file name",
                    name
                )));
            }
        }
        Ok(MailboxConfig {
            data_dir: self.data_dir,
            link_name: self.link_name,
        })
    }
}

/// The request/response pair. Only the party the handshake currently hands
/// the slot to may touch it.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Slot {
    pub requesting_process_id: libc::pid_t,
    pub requested_line_number: u32,
    pub requested_line_len: u32,
    pub requested_line_text: [u8; LINE_SIZE],
}

impl Slot {
    pub fn text(&self) -> &[u8] {
        let len = (self.requested_line_len as usize).min(LINE_SIZE);
        &self.requested_line_text[..len]
    }
}

/// Copies at most `LINE_SIZE` bytes of `line` into the response field.
pub fn copy_into_slot(slot: &mut Slot, line: &[u8]) -> usize {
    let len = line.len().min(LINE_SIZE);
    slot.requested_line_text[..len].copy_from_slice(&line[..len]);
    slot.requested_line_text[len..].fill(0);
    slot.requested_line_len = len as u32;
    len
}

/// Layout of the mailbox region.
#[repr(C)]
pub struct Mailbox {
    mutual_exclusion: Semaphore,
    request_ready: Semaphore,
    response_ready: Semaphore,
    slot: UnsafeCell<Slot>,
    cycles_served: AtomicU64,
}

// Slot access is serialized by the semaphores, see `handshake`.
unsafe impl Sync for Mailbox {}

impl Mailbox {
    pub(crate) fn semaphore(&self, id: SemaphoreId) -> &Semaphore {
        match id {
            SemaphoreId::MutualExclusion => &self.mutual_exclusion,
            SemaphoreId::RequestReady => &self.request_ready,
            SemaphoreId::ResponseReady => &self.response_ready,
        }
    }

    /// # Safety
    /// The caller must hold the slot according to the handshake.
    pub(crate) unsafe fn slot(&self) -> *mut Slot {
        self.slot.get()
    }

    pub(crate) fn record_cycle(&self) -> u64 {
        self.cycles_served.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn cycles_served(&self) -> u64 {
        self.cycles_served.load(Ordering::Acquire)
    }
}

fn create_region(size: usize, link: Option<PathBuf>) -> Result<Shmem> {
    let mut conf = ShmemConf::new().size(size);
    if let Some(path) = &link {
        conf = conf.flink(path);
    }
    match conf.create() {
        Ok(shmem) => Ok(shmem),
        Err(ShmemError::LinkExists) => Err(MailboxError::LinkExists(link.unwrap_or_default())),
        Err(e) => Err(MailboxError::SharedMemory {
            op: "create",
            source: e,
        }),
    }
}

/// Owning handle to the shared mailbox. Dropping it unmaps the region but
/// leaves the semaphores alone, since a peer may still be blocked on them;
/// only `destroy` tears them down.
pub struct MailboxRegion {
    shmem: Shmem,
}

impl MailboxRegion {
    pub fn create(cfg: &MailboxConfig) -> Result<MailboxRegion> {
        let shmem = create_region(mem::size_of::<Mailbox>(), cfg.link_path("mailbox"))?;
        unsafe {
            ptr::write_bytes(shmem.as_ptr(), 0, mem::size_of::<Mailbox>());
            let mailbox = &*(shmem.as_ptr() as *const Mailbox);
            mailbox.mutual_exclusion.init(SemaphoreId::MutualExclusion, 1)?;
            mailbox.request_ready.init(SemaphoreId::RequestReady, 0)?;
            mailbox.response_ready.init(SemaphoreId::ResponseReady, 0)?;
        }
        debug!(
            os_id = shmem.get_os_id(),
            size = shmem.len(),
            "mailbox region created"
        );
        Ok(MailboxRegion { shmem })
    }

    pub fn mailbox(&self) -> &Mailbox {
        unsafe { &*(self.shmem.as_ptr() as *const Mailbox) }
    }

    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }

    /// Drops ownership in a forked child so the region outlives it.
    pub fn relinquish(&mut self) {
        self.shmem.set_owner(false);
    }

    /// Destroys the semaphores and unmaps the region. No worker may still use it.
    pub fn destroy(self) -> Result<()> {
        let mut first_err = None;
        for id in SemaphoreId::ALL {
            if let Err(e) = unsafe { self.mailbox().semaphore(id).destroy(id) } {
                tracing::error!(error = %e, "semaphore teardown failed");
                first_err.get_or_insert(e);
            }
        }
        debug!(os_id = self.shmem.get_os_id(), "mailbox region released");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}


/// Per-client statistics, one slot per client in the results table.
#[repr(C)]
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClientStats {
    pub process_id: libc::pid_t,
    pub requests_issued: u32,
    pub total_wait_nanos: u64,
    pub completed: u32,
}

impl ClientStats {
    pub fn mean_wait(&self) -> Duration {
        if self.requests_issued == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_wait_nanos / u64::from(self.requests_issued))
    }

    pub fn is_completed(&self) -> bool {
        self.completed != 0
    }
}

/// Shared array of `ClientStats`, separate from the mailbox and addressed
/// by the client index the supervisor hands out before forking.
pub struct ResultsTable {
    shmem: Shmem,
    len: usize,
}

unsafe impl Sync for ResultsTable {}

impl ResultsTable {
    pub fn create(cfg: &MailboxConfig, client_count: usize) -> Result<ResultsTable> {
        if client_count == 0 {
            return Err(MailboxError::InvalidConfig(
                "results table needs at least one slot".to_string(),
            ));
        }
        let size = client_count * mem::size_of::<ClientStats>();
        let shmem = create_region(size, cfg.link_path("results"))?;
        let slots = shmem.as_ptr() as *mut ClientStats;
        for i in 0..client_count {
            unsafe { ptr::write(slots.add(i), ClientStats::default()) };
        }
        Ok(ResultsTable {
            shmem,
            len: client_count,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn slot_ptr(&self, index: usize) -> Result<*mut ClientStats> {
        if index >= self.len {
            return Err(MailboxError::InvalidConfig(format!(
                "client index {} out of range for {} slots",
                index, self.len
            )));
        }
        Ok(unsafe { (self.shmem.as_ptr() as *mut ClientStats).add(index) })
    }

    /// Written only by the client owning `index`.
    pub fn record(&self, index: usize, stats: ClientStats) -> Result<()> {
        let slot = self.slot_ptr(index)?;
        unsafe { ptr::write_volatile(slot, stats) };
        Ok(())
    }

    /// Read only after every client has been reaped.
    /// Reads the slot of `index`. Only meaningful once that client has exited.
    pub fn get(&self, index: usize) -> Result<ClientStats> {
        let slot = self.slot_ptr(index)?;
        Ok(unsafe { ptr::read_volatile(slot) })
    }

    pub fn snapshot(&self) -> Vec<ClientStats> {
        (0..self.len)
            .map(|i| unsafe { ptr::read_volatile((self.shmem.as_ptr() as *const ClientStats).add(i)) })
            .collect()
    }

    pub fn relinquish(&mut self) {
        self.shmem.set_owner(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_starts_idle() -> Result<()> {
        let region = MailboxRegion::create(&MailboxConfig::default())?;
        let mailbox = region.mailbox();
        assert_eq!(mailbox.cycles_served(), 0);
        assert!(mailbox.semaphore(SemaphoreId::MutualExclusion).try_wait(SemaphoreId::MutualExclusion)?);
        assert!(!mailbox.semaphore(SemaphoreId::MutualExclusion).try_wait(SemaphoreId::MutualExclusion)?);
        assert!(!mailbox.semaphore(SemaphoreId::RequestReady).try_wait(SemaphoreId::RequestReady)?);
        assert!(!mailbox.semaphore(SemaphoreId::ResponseReady).try_wait(SemaphoreId::ResponseReady)?);
        mailbox.semaphore(SemaphoreId::MutualExclusion).post(SemaphoreId::MutualExclusion)?;
        region.destroy()
    }

    #[test]
    fn results_table_slots_are_independent() -> Result<()> {
        let table = ResultsTable::create(&MailboxConfig::default(), 3)?;
        let stats = ClientStats {
            process_id: 42,
            requests_issued: 4,
            total_wait_nanos: 4_000,
            completed: 1,
        };
        table.record(1, stats)?;
        assert!(table.record(3, stats).is_err());
        let slots = table.snapshot();
        assert_eq!(slots, vec![ClientStats::default(), stats, ClientStats::default()]);
        assert_eq!(slots[1].mean_wait(), Duration::from_nanos(1_000));
        assert!(slots[1].is_completed());
        assert!(!slots[0].is_completed());
        Ok(())
    }

    #[test]
    fn link_files_live_in_data_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = MailboxConfig::builder()
            .data_dir(dir.path().to_string_lossy().to_string())
            .link_name("unit")
            .build()?;
        let region = MailboxRegion::create(&cfg)?;
        assert!(dir.path().join("unit.mailbox").exists());
        match MailboxRegion::create(&cfg) {
            Err(MailboxError::LinkExists(path)) => assert_eq!(path, dir.path().join("unit.mailbox")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second region with the same link was created"),
        }
        region.destroy()?;
        Ok(())
    }

    #[test]
    fn dropping_the_owner_leaves_semaphores_to_peers() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let region = MailboxRegion::create(&MailboxConfig::default())?;
        let peer = ShmemConf::new().os_id(region.os_id()).open()?;
        drop(region);

        let mailbox = unsafe { &*(peer.as_ptr() as *const Mailbox) };
        let sem = mailbox.semaphore(SemaphoreId::MutualExclusion);
        assert!(sem.try_wait(SemaphoreId::MutualExclusion)?);
        assert!(!sem.try_wait(SemaphoreId::MutualExclusion)?);
        sem.post(SemaphoreId::MutualExclusion)?;
        assert!(sem.try_wait(SemaphoreId::MutualExclusion)?);
        Ok(())
    }

    #[test]
    fn builder_rejects_path_like_link_names() {
        assert!(MailboxConfig::builder().link_name("a/b").build().is_err());
        assert!(MailboxConfig::builder().link_name("").build().is_err());
    }

    #[test]
    fn text_is_bounded_by_len() {
        let mut slot = Slot {
            requesting_process_id: 1,
            requested_line_number: 1,
            requested_line_len: 3,
            requested_line_text: [b'x'; LINE_SIZE],
        };
        assert_eq!(slot.text(), b"xxx");
        slot.requested_line_len = 1_000;
        assert_eq!(slot.text().len(), LINE_SIZE);
    }

    #[test]
    fn copy_into_slot_truncates_and_clears_tail() {
        let mut slot = Slot {
            requesting_process_id: 1,
            requested_line_number: 1,
            requested_line_len: 0,
            requested_line_text: [b'z'; LINE_SIZE],
        };
        let long: Vec<u8> = (0..250u32).map(|i| b'a' + (i % 26) as u8).collect();
        assert_eq!(copy_into_slot(&mut slot, &long), LINE_SIZE);
        assert_eq!(slot.text(), &long[..LINE_SIZE]);

        assert_eq!(copy_into_slot(&mut slot, b"short"), 5);
        assert_eq!(slot.text(), b"short");
        assert!(slot.requested_line_text[5..].iter().all(|&b| b == 0));
    }
}
