use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, info, warn};

use super::NamedLock;
use crate::errors::{QueueError, Result};

const UNINIT: u32 = 0;
const READY: u32 = 0x4d4d_5131; // "MMQ1"

const READY_TIMEOUT: Duration = Duration::from_secs(1);
const READY_POLL: Duration = Duration::from_millis(1);

#[repr(C)]
struct LockSegment {
    state: AtomicU32,
    _pad: u32,
    mutex: libc::pthread_mutex_t,
}

/// Outcome of one timed lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    Acquired,
    /// The previous holder died while holding the lock. We own it now.
    Abandoned,
    TimedOut,
    Failed(i32),
}

/// Process-shared robust pthread mutex stored in its own shared-memory object.
///
/// When a holder dies inside its critical section the kernel marks the mutex
/// owner-dead and the next `pthread_mutex_timedlock` returns `EOWNERDEAD` with the
/// lock taken. That case is made consistent and reported as a normal acquisition.
pub struct RobustMutex {
    shmem: Shmem,
    name: String,
}

// The segment is only touched through pthread calls, which are safe to make from any
// thread of any process mapping it.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

fn check(rc: libc::c_int, what: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(QueueError::Lock(format!("{} failed with errno {}", what, rc)))
    }
}

// glibc 2.30+. Not bound by the libc crate.
#[cfg(target_env = "gnu")]
extern "C" {
    fn pthread_mutex_clocklock(
        mutex: *mut libc::pthread_mutex_t,
        clock: libc::clockid_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

/// `timeout` from now, as an absolute time on `clock`.
fn deadline_on(clock: libc::clockid_t, timeout: Duration) -> libc::timespec {
    let mut now: libc::timespec = unsafe { mem::zeroed() };
    unsafe { libc::clock_gettime(clock, &mut now) };
    let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let mut deadline: libc::timespec = unsafe { mem::zeroed() };
    deadline.tv_sec =
        now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t;
    deadline.tv_nsec = (nanos % 1_000_000_000) as libc::c_long;
    deadline
}

/// Waits on the monotonic clock so a wall-clock step cannot stretch the timeout.
#[cfg(target_env = "gnu")]
unsafe fn timed_lock(mutex: *mut libc::pthread_mutex_t, timeout: Duration) -> libc::c_int {
    let deadline = deadline_on(libc::CLOCK_MONOTONIC, timeout);
    pthread_mutex_clocklock(mutex, libc::CLOCK_MONOTONIC, &deadline)
}

/// Without `pthread_mutex_clocklock` the deadline is on the wall clock, and stepping
/// the clock back lengthens the wait by the size of the step.
#[cfg(not(target_env = "gnu"))]
unsafe fn timed_lock(mutex: *mut libc::pthread_mutex_t, timeout: Duration) -> libc::c_int {
    let deadline = deadline_on(libc::CLOCK_REALTIME, timeout);
    libc::pthread_mutex_timedlock(mutex, &deadline)
}

impl RobustMutex {
    /// Opens the lock object `os_id`, creating and initialising it if it does not exist.
    pub fn open_or_create(os_id: &str) -> Result<RobustMutex> {
        let size = mem::size_of::<LockSegment>();
        match ShmemConf::new().size(size).os_id(os_id).create() {
            Ok(mut shmem) => {
                // Never unlink on drop; other processes keep using it.
                shmem.set_owner(false);
                unsafe { Self::init_segment(&shmem)? };
                info!(lock = os_id, "created cross-process lock");
                Ok(RobustMutex { shmem, name: os_id.to_string() })
            }
            Err(ShmemError::MappingIdExists) => Self::open_existing(os_id),
            Err(e) => Err(e.into()),
        }
    }

    unsafe fn init_segment(shmem: &Shmem) -> Result<()> {
        let seg = shmem.as_ptr() as *mut LockSegment;
        let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
        check(libc::pthread_mutexattr_init(&mut attr), "pthread_mutexattr_init")?;
        let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        let rc = if rc == 0 {
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST)
        } else {
            rc
        };
        let rc = if rc == 0 {
            libc::pthread_mutex_init(ptr::addr_of_mut!((*seg).mutex), &attr)
        } else {
            rc
        };
        libc::pthread_mutexattr_destroy(&mut attr);
        check(rc, "pthread_mutex_init")?;
        (*seg).state.store(READY, Ordering::Release);
        Ok(())
    }

    // The creator may still be between shm_open and pthread_mutex_init.
    fn open_existing(os_id: &str) -> Result<RobustMutex> {
        let size = mem::size_of::<LockSegment>();
        let start = Instant::now();
        loop {
            match ShmemConf::new().os_id(os_id).open() {
                Ok(shmem) if shmem.len() >= size => {
                    let seg = shmem.as_ptr() as *const LockSegment;
                    let state = unsafe { (*seg).state.load(Ordering::Acquire) };
                    if state == READY {
                        debug!(lock = os_id, "opened cross-process lock");
                        return Ok(RobustMutex { shmem, name: os_id.to_string() });
                    }
                    if state != UNINIT {
                        return Err(QueueError::Lock(format!(
                            "lock object {} has unexpected state {:#x}",
                            os_id, state
                        )));
                    }
                }
                Ok(_) => {}
                Err(ShmemError::MapOpenFailed(_)) | Err(ShmemError::MapSizeZero) => {}
                Err(e) => return Err(e.into()),
            }
            if start.elapsed() >= READY_TIMEOUT {
                return Err(QueueError::Lock(format!(
                    "lock object {} was never initialised",
                    os_id
                )));
            }
            thread::sleep(READY_POLL);
        }
    }

    #[inline]
    fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        let seg = self.shmem.as_ptr() as *mut LockSegment;
        unsafe { ptr::addr_of_mut!((*seg).mutex) }
    }

    fn lock_for(&self, timeout: Duration) -> Acquire {
        let rc = unsafe { timed_lock(self.mutex_ptr(), timeout) };
        match rc {
            0 => Acquire::Acquired,
            libc::EOWNERDEAD => {
                let rc = unsafe { libc::pthread_mutex_consistent(self.mutex_ptr()) };
                if rc != 0 {
                    debug!(lock = %self.name, errno = rc, "pthread_mutex_consistent failed");
                }
                Acquire::Abandoned
            }
            libc::ETIMEDOUT => Acquire::TimedOut,
            e => Acquire::Failed(e),
        }
    }

    /// Removes the lock object from the system. Processes that still map it keep
    /// their mapping; new openers get a fresh lock.
    pub fn remove(os_id: &str) -> Result<()> {
        match ShmemConf::new().os_id(os_id).open() {
            Ok(mut shmem) => {
                shmem.set_owner(true);
                drop(shmem);
                Ok(())
            }
            Err(ShmemError::MapOpenFailed(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl NamedLock for RobustMutex {
    fn try_acquire(&self, timeout: Duration) -> bool {
        match self.lock_for(timeout) {
            Acquire::Acquired => true,
            Acquire::Abandoned => {
                warn!(lock = %self.name, "previous holder terminated while holding the lock; recovered");
                true
            }
            Acquire::TimedOut => {
                debug!(lock = %self.name, ?timeout, "lock acquisition timed out");
                false
            }
            Acquire::Failed(errno) => {
                warn!(lock = %self.name, errno, "lock acquisition failed");
                false
            }
        }
    }

    fn release(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex_ptr()) };
        if rc != 0 {
            debug!(lock = %self.name, errno = rc, "lock release failed");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
