//! carbon-blk - probe a block device through the AIO backend.
//!
//! Reads one sector through the same submission path the virtio-blk device
//! uses, waits for the queue's eventfd, reaps the completion and optionally
//! writes the sector back in place.
//!
//! This tool requires Linux native AIO. It will not run on other platforms.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "carbon-blk")]
#[command(about = "Probe a block device through the Linux AIO backend")]
struct Args {
    /// Path to a raw block device or disk image
    disk: PathBuf,

    /// Number of independent submission queues
    #[arg(long, default_value = "1")]
    queues: usize,

    /// Maximum in-flight operations per queue
    #[arg(long, default_value = "128")]
    depth: usize,

    /// Queue to submit on
    #[arg(short, long, default_value = "0")]
    queue: usize,

    /// Sector (512 bytes) to read
    #[arg(short, long, default_value = "0")]
    sector: u64,

    /// Open without O_DIRECT (for filesystems that refuse it, e.g. tmpfs)
    #[arg(long)]
    buffered: bool,

    /// Write the sector back after reading it
    #[arg(long)]
    write_back: bool,

    /// Seconds to wait for each completion
    #[arg(long, default_value = "5")]
    timeout: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use carbon_blk::blockdev::{BlockConfig, BlockDevice, IoCompletion, SECTOR_SIZE};
    use carbon_blk::memory::GuestMemory;
    use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
    use std::sync::mpsc;
    use std::time::Duration;
    use tracing::info;

    // O_DIRECT needs an aligned buffer; an anonymous mapping is page aligned.
    // It must outlive the device, whose io_destroy waits for in-flight reads.
    let scratch = GuestMemory::new(4096)?;

    let config = BlockConfig {
        queue_count: args.queues,
        queue_depth: args.depth,
        direct: !args.buffered,
        ..BlockConfig::new(&args.disk)
    };
    let device = BlockDevice::open_with(&config)?;
    info!(
        path = %device.path().display(),
        size = device.size(),
        queues = device.queue_count(),
        "opened block device"
    );

    let offset = args
        .sector
        .checked_mul(SECTOR_SIZE)
        .filter(|offset| offset + SECTOR_SIZE <= device.size())
        .ok_or("sector is beyond the end of the device")?;
    let queue = device.queue(args.queue)?;

    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
    epoll.add(
        queue.notifier(),
        EpollEvent::new(EpollFlags::EPOLLIN, queue.index() as u64),
    )?;

    let buf = scratch.host_span(0, SECTOR_SIZE)?;
    let timeout = Duration::from_secs(args.timeout);

    let (tx, rx) = mpsc::channel();
    let on_read = {
        let tx = tx.clone();
        Box::new(move |c: IoCompletion| {
            let _ = tx.send(c);
        })
    };
    // SAFETY: `scratch` outlives the wait below, which reaps the completion.
    unsafe { queue.submit_read(buf, SECTOR_SIZE as usize, offset, on_read)? };
    let read = wait::for_completion(&epoll, &queue, &rx, timeout)?;
    let bytes = read.bytes()?;

    let mut data = [0u8; SECTOR_SIZE as usize];
    scratch.read(0, &mut data)?;
    info!(sector = args.sector, offset, bytes, "read complete");
    for (i, line) in data.chunks(16).take(4).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:08x}  {}", offset + i as u64 * 16, hex.join(" "));
    }

    if args.write_back {
        let on_write = Box::new(move |c: IoCompletion| {
            let _ = tx.send(c);
        });
        // SAFETY: as above.
        unsafe { queue.submit_write(buf, SECTOR_SIZE as usize, offset, on_write)? };
        let write = wait::for_completion(&epoll, &queue, &rx, timeout)?;
        info!(bytes = write.bytes()?, "write-back complete");
    }

    Ok(())
}

#[cfg(target_os = "linux")]
mod wait {
    use carbon_blk::blockdev::{BlockQueue, IoCompletion};
    use nix::errno::Errno;
    use nix::sys::epoll::{Epoll, EpollEvent, EpollTimeout};
    use std::sync::mpsc::Receiver;
    use std::time::{Duration, Instant};
    use tracing::debug;

    /// Wait on the queue's eventfd until a completion has been delivered to
    /// `rx` or `timeout` elapses.
    pub fn for_completion(
        epoll: &Epoll,
        queue: &BlockQueue,
        rx: &Receiver<IoCompletion>,
        timeout: Duration,
    ) -> Result<IoCompletion, Box<dyn std::error::Error>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(completion) = rx.try_recv() {
                return Ok(completion);
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or("timed out waiting for completion")?;

            let mut events = [EpollEvent::empty()];
            let ready = match epoll.wait(&mut events, EpollTimeout::try_from(remaining)?) {
                Ok(n) => n,
                Err(Errno::EINTR) => 0,
                Err(e) => return Err(e.into()),
            };
            if ready > 0 {
                let signalled = queue.clear_notification()?;
                let reaped = queue.poll(Some(Duration::ZERO))?;
                debug!(queue = queue.index(), signalled, reaped, "queue notified");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("carbon-blk requires Linux native AIO. This platform is not supported.".into())
}
