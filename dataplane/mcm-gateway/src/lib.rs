//! Zero-copy gateway: attaches a System V shared-memory region and exposes a
//! polling TX half and a writing RX half, synchronized by a leading 4-byte
//! sequence counter rather than a ring protocol.
//!
//! Region layout: `[u32 seq (LE)][payload: size - 4 bytes]`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const SEQ_HEADER_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("shared memory region too small: need at least {SEQ_HEADER_SIZE} bytes, got {0}")]
    RegionTooSmall(usize),
    #[error("shmget failed (errno {0})")]
    ShmGetFailed(i32),
    #[error("shmat failed (errno {0})")]
    ShmAtFailed(i32),
    #[error("gateway is not in the active state")]
    WrongState,
    #[error("zero-copy gateway is not implemented on this platform")]
    NotImplemented,
}

#[cfg(unix)]
mod shm {
    use super::GatewayError;

    /// An attached System V shared-memory region.
    ///
    /// `ptr`/`size` describe the whole region including the 4-byte sequence
    /// header. Manual `Send`/`Sync` is sound because all access to the
    /// region after attach goes through the sequence-counter protocol in
    /// this crate, never through ordinary Rust aliasing rules.
    pub struct ShmRegion {
        ptr: *mut u8,
        size: usize,
    }

    unsafe impl Send for ShmRegion {}
    unsafe impl Sync for ShmRegion {}

    impl ShmRegion {
        pub fn attach(key: i32, size: usize) -> Result<Self, GatewayError> {
            if size < super::SEQ_HEADER_SIZE {
                return Err(GatewayError::RegionTooSmall(size));
            }
            unsafe {
                let id = libc::shmget(key as libc::key_t, size, libc::IPC_CREAT | 0o666);
                if id < 0 {
                    return Err(GatewayError::ShmGetFailed(*libc::__errno_location()));
                }
                let ptr = libc::shmat(id, std::ptr::null(), 0);
                if ptr == usize::MAX as *mut libc::c_void {
                    return Err(GatewayError::ShmAtFailed(*libc::__errno_location()));
                }
                Ok(Self {
                    ptr: ptr as *mut u8,
                    size,
                })
            }
        }

        pub fn size(&self) -> usize {
            self.size
        }

        /// Reads the leading sequence counter.
        pub fn seq(&self) -> u32 {
            unsafe { std::ptr::read_volatile(self.ptr as *const u32) }
        }

        /// Writes the leading sequence counter.
        pub fn set_seq(&self, value: u32) {
            unsafe { std::ptr::write_volatile(self.ptr as *mut u32, value) };
        }

        /// The payload region following the sequence header.
        pub fn payload(&self) -> &[u8] {
            unsafe {
                std::slice::from_raw_parts(
                    self.ptr.add(super::SEQ_HEADER_SIZE),
                    self.size - super::SEQ_HEADER_SIZE,
                )
            }
        }

        /// Mutable access to the payload region following the sequence header.
        ///
        /// # Safety
        /// The caller must ensure no other thread is reading or writing the
        /// payload concurrently; the sequence-counter protocol in this crate
        /// is what normally provides that guarantee.
        pub unsafe fn payload_mut(&self) -> &mut [u8] {
            std::slice::from_raw_parts_mut(
                self.ptr.add(super::SEQ_HEADER_SIZE),
                self.size - super::SEQ_HEADER_SIZE,
            )
        }
    }

    impl Drop for ShmRegion {
        fn drop(&mut self) {
            unsafe {
                libc::shmdt(self.ptr as *const libc::c_void);
            }
        }
    }
}

#[cfg(unix)]
use shm::ShmRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatewayState {
    NotConfigured,
    Active,
    Shutdown,
}

/// Transmit half: polls the sequence counter and invokes a callback whenever
/// it advances.
pub struct GatewayTx {
    #[cfg(unix)]
    region: Arc<ShmRegion>,
    state: AtomicBool,
    ctx: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl GatewayTx {
    #[cfg(unix)]
    pub fn attach(key: i32, size: usize) -> Result<Self, GatewayError> {
        let region = Arc::new(ShmRegion::attach(key, size)?);
        Ok(Self {
            region,
            state: AtomicBool::new(true),
            ctx: CancellationToken::new(),
            task: None,
        })
    }

    #[cfg(not(unix))]
    pub fn attach(_key: i32, _size: usize) -> Result<Self, GatewayError> {
        Err(GatewayError::NotImplemented)
    }

    /// Spawns the polling task. `on_receive(payload, last_seen_len)` is
    /// invoked with the full payload slice whenever the sequence counter
    /// advances.
    #[cfg(unix)]
    pub fn start<F>(&mut self, mut on_receive: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let region = self.region.clone();
        let ctx = self.ctx.clone();
        self.task = Some(tokio::spawn(async move {
            let mut last_seq = region.seq();
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        debug!("zero-copy gateway tx task cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(POLL_INTERVAL) => {
                        let seq = region.seq();
                        if seq != last_seq {
                            last_seq = seq;
                            on_receive(region.payload());
                        }
                    }
                }
            }
        }));
    }

    pub async fn shutdown(mut self) {
        self.state.store(false, Ordering::Release);
        self.ctx.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("zero-copy gateway tx task join failed: {err}");
            }
        }
    }
}

/// Receive half: writes payload bytes and bumps the sequence counter.
pub struct GatewayRx {
    #[cfg(unix)]
    region: ShmRegion,
    state: GatewayState,
}

impl GatewayRx {
    #[cfg(unix)]
    pub fn attach(key: i32, size: usize) -> Result<Self, GatewayError> {
        let region = ShmRegion::attach(key, size)?;
        Ok(Self {
            region,
            state: GatewayState::Active,
        })
    }

    #[cfg(not(unix))]
    pub fn attach(_key: i32, _size: usize) -> Result<Self, GatewayError> {
        Err(GatewayError::NotImplemented)
    }

    #[cfg(unix)]
    pub fn transmit(&mut self, src: &[u8]) -> Result<usize, GatewayError> {
        if self.state != GatewayState::Active {
            return Err(GatewayError::WrongState);
        }
        let dst = unsafe { self.region.payload_mut() };
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        self.region.set_seq(self.region.seq().wrapping_add(1));
        Ok(n)
    }

    #[cfg(not(unix))]
    pub fn transmit(&mut self, _src: &[u8]) -> Result<usize, GatewayError> {
        Err(GatewayError::NotImplemented)
    }

    pub fn shutdown(&mut self) {
        self.state = GatewayState::Shutdown;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn test_key() -> i32 {
        static NEXT: AtomicU32 = AtomicU32::new(0x6d63_6d00);
        NEXT.fetch_add(1, Ordering::Relaxed) as i32
    }

    #[tokio::test]
    async fn rx_transmit_advances_sequence_and_tx_observes_payload() {
        let key = test_key();
        let size = 64usize;
        let mut rx = GatewayRx::attach(key, size).unwrap();
        let mut tx = GatewayTx::attach(key, size).unwrap();

        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        tx.start(move |payload| {
            *received_clone.lock().unwrap() = payload[..5].to_vec();
        });

        rx.transmit(b"hello").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(&*received.lock().unwrap(), b"hello");

        tx.shutdown().await;
        rx.shutdown();
    }

    #[test]
    fn rx_rejects_transmit_after_shutdown() {
        let key = test_key();
        let mut rx = GatewayRx::attach(key, 64).unwrap();
        rx.shutdown();
        assert!(matches!(rx.transmit(b"x"), Err(GatewayError::WrongState)));
    }
}
