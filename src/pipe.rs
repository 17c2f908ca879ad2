//! Platform byte pipes to the host: Unix domain sockets and Windows named pipes.
//!
//! The host listens on `discord-ipc-0` .. `discord-ipc-9`; the first one that
//! accepts wins.

use std::io;
use std::path::PathBuf;

use tracing::{debug, trace};

use crate::constants::{PIPE_PREFIX, PIPE_SLOTS};

/// Raw, non-blocking byte pipe.
pub trait Pipe: Send {
    fn open(&mut self) -> bool;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    /// `Ok(0)` means the peer closed the pipe, `WouldBlock` that nothing is
    /// available yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}

fn pipe_name(slot: u32) -> String {
    format!("{PIPE_PREFIX}{slot}")
}

/// Каталог с сокетами хоста: первая заданная переменная окружения или /tmp.
pub fn default_ipc_dir() -> PathBuf {
    ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"]
        .iter()
        .find_map(|var| std::env::var_os(var).filter(|v| !v.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(unix)]
pub use unix::UnixPipe as PlatformPipe;
#[cfg(windows)]
pub use windows::NamedPipe as PlatformPipe;

#[cfg(unix)]
mod unix {
    use std::io::{self, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use super::*;

    /// Сколько ждать, пока сокет примет кадр, прежде чем считать его мёртвым.
    const WRITE_STALL_LIMIT: Duration = Duration::from_secs(1);

    pub struct UnixPipe {
        dir: PathBuf,
        stream: Option<UnixStream>,
    }

    impl UnixPipe {
        pub fn new(dir: Option<PathBuf>) -> Self {
            Self {
                dir: dir.unwrap_or_else(default_ipc_dir),
                stream: None,
            }
        }

        fn failed(&mut self, err: io::Error) -> io::Error {
            if !matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) {
                self.close();
            }
            err
        }
    }

    impl Pipe for UnixPipe {
        fn open(&mut self) -> bool {
            for slot in 0..PIPE_SLOTS {
                let path = self.dir.join(pipe_name(slot));
                match UnixStream::connect(&path) {
                    Ok(stream) => {
                        if stream.set_nonblocking(true).is_err() {
                            continue;
                        }
                        debug!(path = %path.display(), "pipe opened");
                        self.stream = Some(stream);
                        return true;
                    }
                    Err(err) => trace!(path = %path.display(), %err, "pipe slot unavailable"),
                }
            }
            false
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }

        fn is_open(&self) -> bool {
            self.stream.is_some()
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(stream) = self.stream.as_mut() else {
                return Err(io::ErrorKind::NotConnected.into());
            };
            match stream.read(buf) {
                Ok(0) => {
                    self.close();
                    Ok(0)
                }
                Ok(n) => Ok(n),
                Err(err) => Err(self.failed(err)),
            }
        }

        fn write(&mut self, mut data: &[u8]) -> io::Result<()> {
            let deadline = Instant::now() + WRITE_STALL_LIMIT;
            while !data.is_empty() {
                let Some(stream) = self.stream.as_mut() else {
                    return Err(io::ErrorKind::NotConnected.into());
                };
                match stream.write(data) {
                    Ok(0) => return Err(self.failed(io::ErrorKind::WriteZero.into())),
                    Ok(n) => data = &data[n..],
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline =>
                    {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        self.close();
                        return Err(err);
                    }
                }
            }
            Ok(())
        }
    }

    impl Drop for UnixPipe {
        fn drop(&mut self) {
            self.close();
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::ffi::c_void;
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::windows::io::AsRawHandle;
    use std::path::PathBuf;
    use std::ptr::null_mut;

    use super::*;

    #[link(name = "kernel32")]
    extern "system" {
        /// Сколько байт можно прочитать из канала без блокировки.
        fn PeekNamedPipe(
            hNamedPipe: *mut c_void,
            lpBuffer: *mut c_void,
            nBufferSize: u32,
            lpBytesRead: *mut u32,
            lpTotalBytesAvail: *mut u32,
            lpBytesLeftThisMessage: *mut u32,
        ) -> i32;
    }

    pub struct NamedPipe {
        file: Option<File>,
    }

    impl NamedPipe {
        /// The directory override only applies to Unix sockets.
        pub fn new(_dir: Option<PathBuf>) -> Self {
            Self { file: None }
        }

        fn available(file: &File) -> io::Result<u32> {
            let mut avail = 0u32;
            let ok = unsafe {
                PeekNamedPipe(
                    file.as_raw_handle() as *mut c_void,
                    null_mut(),
                    0,
                    null_mut(),
                    &mut avail,
                    null_mut(),
                )
            };
            if ok == 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(avail)
            }
        }
    }

    impl Pipe for NamedPipe {
        fn open(&mut self) -> bool {
            for slot in 0..PIPE_SLOTS {
                let path = format!(r"\\?\pipe\{}", pipe_name(slot));
                match OpenOptions::new().read(true).write(true).open(&path) {
                    Ok(file) => {
                        debug!(%path, "pipe opened");
                        self.file = Some(file);
                        return true;
                    }
                    Err(err) => trace!(%path, %err, "pipe slot unavailable"),
                }
            }
            false
        }

        fn close(&mut self) {
            self.file = None;
        }

        fn is_open(&self) -> bool {
            self.file.is_some()
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(file) = self.file.as_mut() else {
                return Err(io::ErrorKind::NotConnected.into());
            };
            let avail = match Self::available(file) {
                Ok(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Ok(n) => n as usize,
                Err(_) => {
                    self.close();
                    return Ok(0);
                }
            };
            let len = avail.min(buf.len());
            match file.read(&mut buf[..len]) {
                Ok(0) => {
                    self.close();
                    Ok(0)
                }
                Ok(n) => Ok(n),
                Err(err) => {
                    self.close();
                    Err(err)
                }
            }
        }

        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            let Some(file) = self.file.as_mut() else {
                return Err(io::ErrorKind::NotConnected.into());
            };
            let result = file.write_all(data);
            if result.is_err() {
                self.close();
            }
            result
        }
    }
}
