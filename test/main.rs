//! Cross-process checks. The parent runs each scenario and spawns copies of this
//! binary as the other process.

use std::env;
use std::error::Error;
use std::process::{self, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use mmlog_shmem::core::name;
use mmlog_shmem::lock::{NamedLock, RobustMutex};
use mmlog_shmem::{logging, RingBuffer};

const PRODUCED: usize = 20_000;

type TestResult = Result<(), Box<dyn Error>>;

fn main() {
    logging::init("info");
    let args: Vec<String> = env::args().skip(1).collect();
    let outcome = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["produce", buffer, count] => produce(buffer, count.parse().unwrap_or(0)),
        ["die-holding-lock", buffer] => die_holding_lock(buffer),
        [] => run_all(),
        other => Err(format!("unknown arguments {:?}", other).into()),
    };
    if let Err(e) = outcome {
        error!("{}", e);
        process::exit(1);
    }
}

fn run_all() -> TestResult {
    let scenarios: [(&str, fn(&str) -> TestResult); 3] = [
        ("fifo across processes", fifo_across_processes),
        ("records outlive their producer", records_outlive_producer),
        ("lock held by a dead process is recovered", dead_holder_is_recovered),
    ];
    let mut failed = 0;
    for (i, (label, scenario)) in scenarios.iter().enumerate() {
        let buffer = format!("integration_{}_{}", process::id(), i);
        let result = scenario(&buffer);
        let _ = RingBuffer::remove(&buffer);
        match result {
            Ok(()) => println!("[ok]   {}", label),
            Err(e) => {
                println!("[FAIL] {}: {}", label, e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(format!("{} scenario(s) failed", failed).into());
    }
    println!("All scenarios passed.");
    Ok(())
}

fn payload(i: usize) -> Vec<u8> {
    format!("{:08}:{}", i, "x".repeat(i % 200)).into_bytes()
}

fn spawn_self(args: &[&str]) -> Result<process::Child, Box<dyn Error>> {
    Ok(Command::new(env::current_exe()?).args(args).stdin(Stdio::null()).spawn()?)
}

fn produce(buffer: &str, count: usize) -> TestResult {
    let queue = RingBuffer::open_or_create(buffer)?;
    for i in 0..count {
        let p = payload(i);
        while !queue.try_enqueue(&p) {
            thread::yield_now();
        }
    }
    info!(buffer, count, "producer done");
    Ok(())
}

fn die_holding_lock(buffer: &str) -> TestResult {
    let lock_id = name::os_id(&name::normalize(buffer, name::LOCK_PREFIX)?);
    let lock = RobustMutex::open_or_create(&lock_id)?;
    if !lock.try_acquire(Duration::from_secs(1)) {
        return Err("could not take the lock".into());
    }
    info!(buffer, "holding the lock and aborting");
    process::abort();
}

fn fifo_across_processes(buffer: &str) -> TestResult {
    // Small enough that the producer wraps many times and regularly finds it full.
    let queue = RingBuffer::open_or_create_with_capacity(buffer, 8 * 1024)?;
    let count = PRODUCED.to_string();
    let mut child = spawn_self(&["produce", buffer, count.as_str()])?;

    let deadline = Instant::now() + Duration::from_secs(120);
    let mut next = 0;
    while next < PRODUCED {
        if Instant::now() > deadline {
            return Err(format!("consumer stalled at {}", next).into());
        }
        match queue.try_dequeue() {
            Some(p) if p == payload(next) => next += 1,
            Some(p) => {
                return Err(format!("record {} out of order: {:?}", next, String::from_utf8_lossy(&p)).into())
            }
            None => thread::yield_now(),
        }
    }
    if !child.wait()?.success() {
        return Err("producer process failed".into());
    }
    let stats = queue.get_stats();
    if stats.message_count != 0 {
        return Err(format!("{} records left over", stats.message_count).into());
    }
    Ok(())
}

fn records_outlive_producer(buffer: &str) -> TestResult {
    if !spawn_self(&["produce", buffer, "10"])?.wait()?.success() {
        return Err("producer process failed".into());
    }
    let queue = RingBuffer::open_or_create(buffer)?;
    for i in 0..10 {
        if queue.try_dequeue() != Some(payload(i)) {
            return Err(format!("record {} missing after the producer exited", i).into());
        }
    }
    if queue.try_dequeue().is_some() {
        return Err("unexpected extra record".into());
    }
    Ok(())
}

fn dead_holder_is_recovered(buffer: &str) -> TestResult {
    let queue = RingBuffer::open_or_create_with_capacity(buffer, 4096)?;
    if !queue.try_enqueue(b"before") {
        return Err("initial enqueue failed".into());
    }

    // Aborting is the expected outcome; only its side effect matters.
    let status = spawn_self(&["die-holding-lock", buffer])?.wait()?;
    if status.success() {
        return Err("lock holder exited cleanly instead of dying".into());
    }

    let started = Instant::now();
    if !queue.try_enqueue(b"after") {
        return Err("enqueue after holder death failed".into());
    }
    if started.elapsed() > Duration::from_millis(900) {
        return Err(format!("recovery took {:?}", started.elapsed()).into());
    }
    let drained = [queue.try_dequeue(), queue.try_dequeue()];
    if drained != [Some(b"before".to_vec()), Some(b"after".to_vec())] {
        return Err("records lost across lock recovery".into());
    }
    Ok(())
}
