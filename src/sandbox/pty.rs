//! Pseudo-terminal between the user's terminal and the sandboxed program.
//!
//! The child gets the slave side as its controlling terminal. Output is
//! copied master → stdout; keystrokes are copied stdin → master only when
//! stdin is a terminal, which is then put into raw mode for the attempt.
//!
//! Only the master is non-blocking. On a terminal, stdin, stdout and stderr
//! share one open file description, so fd 0 keeps its flags and is read on
//! a plain thread instead.

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{self, SetArg, Termios};
use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::error::SandboxError;

/// How long remaining output may take to drain after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How often the input thread checks whether it should stop.
const INPUT_POLL_MS: u16 = 100;

nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

/// Window size of the terminal on `fd`, if it is one.
pub fn window_size(fd: RawFd) -> Option<libc::winsize> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `size` is a valid winsize for the kernel to fill in.
    unsafe { tiocgwinsz(fd, &mut size) }.ok()?;
    Some(size)
}

pub fn set_window_size(fd: RawFd, size: &libc::winsize) -> io::Result<()> {
    // SAFETY: `size` points to an initialized winsize.
    unsafe { tiocswinsz(fd, size) }.map_err(io::Error::from)?;
    Ok(())
}

fn set_nonblocking<Fd: AsFd>(fd: Fd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(&fd, FcntlArg::F_GETFL)?);
    fcntl(&fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A freshly allocated pty pair.
#[derive(Debug)]
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: File,
}

/// Allocate a pty sized like the user's terminal (when stdout is one).
pub fn open() -> Result<PtyPair, SandboxError> {
    let size = window_size(libc::STDOUT_FILENO);
    let pair = nix::pty::openpty(size.as_ref(), None::<&Termios>).map_err(io::Error::from)?;
    Ok(PtyPair {
        master: pair.master,
        slave: File::from(pair.slave),
    })
}

/// Puts a terminal into raw mode and restores it on drop. File status flags
/// are left alone.
struct StdinGuard {
    terminal: File,
    termios: Termios,
}

impl StdinGuard {
    fn acquire(terminal: File) -> io::Result<Self> {
        let original = termios::tcgetattr(&terminal)?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&terminal, SetArg::TCSANOW, &raw)?;
        Ok(Self {
            terminal,
            termios: original,
        })
    }
}

impl Drop for StdinGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(&self.terminal, SetArg::TCSADRAIN, &self.termios) {
            debug!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// Blocking read loop over `source`, forwarding chunks until `stop` is set,
/// the terminal closes or the receiver goes away.
fn read_terminal(source: File, stop: Arc<AtomicBool>, chunks: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::Relaxed) {
        let mut fds = [PollFd::new(source.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(INPUT_POLL_MS)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => {
                debug!("stdin poll failed: {}", e);
                break;
            }
        }
        let n = match (&source).read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("stdin relay stopped: {}", e);
                break;
            }
        };
        if chunks.blocking_send(buf[..n].to_vec()).is_err() {
            break;
        }
    }
}

/// Handle on the thread running [`read_terminal`].
struct InputReader {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl InputReader {
    fn spawn(source: File, chunks: mpsc::Sender<Vec<u8>>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("winecage-stdin".to_string())
            .spawn(move || read_terminal(source, flag, chunks))?;
        Ok(Self { stop, thread })
    }

    /// Stop reading; returns once the thread no longer touches the terminal.
    async fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let thread = self.thread;
        if !matches!(tokio::task::spawn_blocking(move || thread.join()).await, Ok(Ok(()))) {
            debug!("stdin reader thread panicked");
        }
    }
}

async fn read_some(fd: &AsyncFd<File>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.read(buf)
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn write_all(fd: &AsyncFd<File>, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let mut guard = fd.writable().await?;
        match guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.write(buf)
        }) {
            Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => buf = &buf[n..],
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

/// Copy everything the child writes to our stdout until the pty closes.
async fn relay_output(master: Arc<AsyncFd<File>>) {
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 4096];
    loop {
        match read_some(&master, &mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = stdout.write_all(&buf[..n]).await {
                    debug!("pty output relay stopped: {}", e);
                    break;
                }
                let _ = stdout.flush().await;
            }
            // Linux reports EIO on the master once the last slave fd closes.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => {
                debug!("pty output relay stopped: {}", e);
                break;
            }
        }
    }
}

async fn relay_input(mut chunks: mpsc::Receiver<Vec<u8>>, master: Arc<AsyncFd<File>>) {
    while let Some(chunk) = chunks.recv().await {
        if let Err(e) = write_all(&master, &chunk).await {
            debug!("pty input relay stopped: {}", e);
            break;
        }
    }
}

/// Relay tasks and terminal state for one attempt.
pub struct PtySession {
    master: Arc<AsyncFd<File>>,
    output: JoinHandle<()>,
    input: Option<(InputReader, JoinHandle<()>)>,
    stdin_guard: Option<StdinGuard>,
}

impl PtySession {
    /// Start relaying on `master`. Must run inside a tokio runtime.
    pub fn start(master: OwnedFd) -> Result<Self, SandboxError> {
        set_nonblocking(&master)?;
        let master = Arc::new(AsyncFd::new(File::from(master))?);
        let output = tokio::spawn(relay_output(Arc::clone(&master)));

        let mut stdin_guard = None;
        let mut input = None;
        if io::stdin().is_terminal() {
            let terminal = File::from(io::stdin().as_fd().try_clone_to_owned()?);
            let guard = StdinGuard::acquire(terminal.try_clone()?)?;
            let (tx, rx) = mpsc::channel(16);
            let reader = InputReader::spawn(terminal, tx)?;
            let relay = tokio::spawn(relay_input(rx, Arc::clone(&master)));
            input = Some((reader, relay));
            stdin_guard = Some(guard);
        } else {
            debug!("stdin is not a terminal, not relaying input");
        }

        Ok(Self {
            master,
            output,
            input,
            stdin_guard,
        })
    }

    /// Copy the user's terminal size to the child's terminal.
    pub fn sync_window_size(&self) {
        if let Some(size) = window_size(libc::STDOUT_FILENO)
            && let Err(e) = set_window_size(self.master.as_raw_fd(), &size)
        {
            debug!("Failed to resize pty: {}", e);
        }
    }

    /// Stop relaying and restore the terminal. Output still buffered in the
    /// pty gets a short grace period to drain.
    pub async fn finish(mut self) {
        if let Some((reader, relay)) = self.input.take() {
            relay.abort();
            let _ = relay.await;
            reader.stop().await;
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut self.output)
            .await
            .is_err()
        {
            self.output.abort();
        }
        drop(self.stdin_guard.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_round_trip_on_pty() {
        let pair = open().unwrap();
        let size = libc::winsize {
            ws_row: 42,
            ws_col: 132,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        set_window_size(pair.master.as_raw_fd(), &size).unwrap();
        let read = window_size(pair.slave.as_raw_fd()).unwrap();
        assert_eq!((read.ws_row, read.ws_col), (42, 132));
    }

    #[test]
    fn test_window_size_of_regular_file() {
        let file = tempfile::tempfile().unwrap();
        assert!(window_size(file.as_raw_fd()).is_none());
    }

    #[tokio::test]
    async fn test_read_reports_eio_after_slave_closed() {
        let pair = open().unwrap();
        let mut slave = pair.slave;
        slave.write_all(b"hello").unwrap();

        set_nonblocking(&pair.master).unwrap();
        let master = AsyncFd::new(File::from(pair.master)).unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        while collected.len() < 5 {
            let n = read_some(&master, &mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"hello");

        drop(slave);
        match read_some(&master, &mut buf).await {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.raw_os_error(), Some(libc::EIO)),
        }
    }

    #[test]
    fn test_raw_input_keeps_shared_terminal_blocking() {
        let pair = open().unwrap();
        let terminal = pair.slave;
        let mut output = terminal.try_clone().unwrap();

        let guard = StdinGuard::acquire(terminal.try_clone().unwrap()).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let reader = InputReader::spawn(terminal, tx).unwrap();

        let flags = OFlag::from_bits_truncate(fcntl(&output, FcntlArg::F_GETFL).unwrap());
        assert!(!flags.contains(OFlag::O_NONBLOCK));

        // Far more than the pty buffer holds: the writer has to wait for the
        // reader instead of failing with WouldBlock.
        const TOTAL: usize = 1 << 20;
        let writer = thread::spawn(move || output.write_all(&vec![b'x'; TOTAL]));
        let mut master = File::from(pair.master);
        let mut buf = [0u8; 65536];
        let mut received = 0;
        while received < TOTAL {
            let n = master.read(&mut buf).unwrap();
            assert!(n > 0);
            received += n;
        }
        writer.join().unwrap().unwrap();
        assert_eq!(received, TOTAL);

        reader.stop.store(true, Ordering::Relaxed);
        reader.thread.join().unwrap();
        drop(guard);
    }
}
