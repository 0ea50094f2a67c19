//! Windows backend: overlapped named pipes driven through an I/O completion
//! port.
//!
//! IOCP reports completions, not readiness. Each stream keeps one staging
//! buffer with at most one overlapped operation in flight; `read`/`write`
//! copy to and from that buffer and answer `WouldBlock` while the operation
//! is pending. A read that leaves staged bytes behind re-posts the stream's
//! token, so the loop sees it as still readable the way level-triggered epoll
//! and kqueue would report it. This keeps the event loop identical on every
//! platform.

#![allow(unsafe_code)]

use super::{
    decode_token, token, Multiplexer, PlatformBackend, Readiness, SpawnRequest, SpawnedChild,
    Termination, Waker, WAKE_TOKEN,
};
use crate::config::EngineConfig;
use crate::descriptor::RawDescriptor;
use crate::process::{ProcessKey, Stream};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, IntoRawHandle, OwnedHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, ERROR_IO_PENDING,
    ERROR_NO_DATA, ERROR_OPERATION_ABORTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED,
    FILE_WRITE_ATTRIBUTES, OPEN_EXISTING, PIPE_ACCESS_INBOUND, PIPE_ACCESS_OUTBOUND,
};
use windows_sys::Win32::System::Pipes::{
    CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE, PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, ResumeThread, TerminateProcess, WaitForSingleObject,
    CREATE_NO_WINDOW, CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, PROCESS_INFORMATION,
    STARTF_USESTDHANDLES, STARTUPINFOW,
};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
    OVERLAPPED,
};

const PIPE_BUFFER_SIZE: u32 = EngineConfig::DEFAULT_BUFFER_CAPACITY as u32;
const TERMINATED_EXIT_CODE: u32 = 1;

// Child-side pipe ends are inheritable; spawns are serialized so one child
// never inherits another child's pipes.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());
static PIPE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Process and main-thread handles of a spawned child.
#[derive(Debug)]
pub(crate) struct ChildHandle {
    process: isize,
    thread: isize,
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        // SAFETY: both handles are owned by this struct and closed once.
        unsafe {
            CloseHandle(self.process as HANDLE);
            CloseHandle(self.thread as HANDLE);
        }
    }
}

pub(crate) fn close_descriptor(raw: RawDescriptor) {
    // SAFETY: only called by RefCountedDescriptor, which owns the handle and
    // closes it exactly once.
    unsafe {
        CloseHandle(raw as HANDLE);
    }
}

pub(crate) struct WindowsBackend;

impl PlatformBackend for WindowsBackend {
    type Multiplexer = CompletionPort;

    fn spawn(request: &SpawnRequest<'_>) -> io::Result<SpawnedChild> {
        let mut command_line = make_command_line(request.command)?;
        let environment = make_environment_block(request.environment)?;
        let current_dir = request
            .current_dir
            .map(|dir| to_wide_nul(dir.as_os_str()))
            .transpose()?;

        let _guard = SPAWN_LOCK.lock().unwrap();
        let (stdin_parent, stdin_child) = create_pipe(PipeDirection::ParentWrites)?;
        let (stdout_parent, stdout_child) = create_pipe(PipeDirection::ParentReads)?;
        let (stderr_parent, stderr_child) = create_pipe(PipeDirection::ParentReads)?;

        // SAFETY: zeroed STARTUPINFOW/PROCESS_INFORMATION are valid initial
        // values; all pointers passed to CreateProcessW outlive the call.
        let info = unsafe {
            let mut startup: STARTUPINFOW = std::mem::zeroed();
            startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
            startup.dwFlags = STARTF_USESTDHANDLES;
            startup.hStdInput = stdin_child.as_raw_handle() as HANDLE;
            startup.hStdOutput = stdout_child.as_raw_handle() as HANDLE;
            startup.hStdError = stderr_child.as_raw_handle() as HANDLE;

            let mut info: PROCESS_INFORMATION = std::mem::zeroed();
            let ok = CreateProcessW(
                std::ptr::null(),
                command_line.as_mut_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                1,
                CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT | CREATE_NO_WINDOW,
                environment.as_ptr().cast(),
                current_dir
                    .as_ref()
                    .map_or(std::ptr::null(), |dir| dir.as_ptr()),
                &startup,
                &mut info,
            );
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            info
        };
        drop((stdin_child, stdout_child, stderr_child));
        debug!("Created suspended pid {}", info.dwProcessId);

        Ok(SpawnedChild {
            pid: info.dwProcessId,
            handle: ChildHandle {
                process: info.hProcess as isize,
                thread: info.hThread as isize,
            },
            stdin: stdin_parent.into_raw_handle() as isize,
            stdout: stdout_parent.into_raw_handle() as isize,
            stderr: stderr_parent.into_raw_handle() as isize,
            early_exit: None,
        })
    }

    fn make_multiplexer(buffer_capacity: usize) -> io::Result<CompletionPort> {
        CompletionPort::new(buffer_capacity)
    }

    fn try_wait(child: &ChildHandle) -> io::Result<Option<i32>> {
        // SAFETY: the process handle is open for the lifetime of `child`.
        unsafe {
            match WaitForSingleObject(child.process as HANDLE, 0) {
                WAIT_OBJECT_0 => {
                    let mut code = 0u32;
                    if GetExitCodeProcess(child.process as HANDLE, &mut code) == 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(Some(code as i32))
                }
                WAIT_TIMEOUT => Ok(None),
                _ => Err(io::Error::last_os_error()),
            }
        }
    }

    fn signal(child: &ChildHandle, _termination: Termination) -> io::Result<()> {
        // SAFETY: the process handle is open for the lifetime of `child`.
        if unsafe { TerminateProcess(child.process as HANDLE, TERMINATED_EXIT_CODE) } == 0 {
            let err = io::Error::last_os_error();
            // Already exited.
            if Self::try_wait(child)?.is_some() {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn resume(child: &ChildHandle) -> io::Result<()> {
        // SAFETY: the thread handle is open for the lifetime of `child`.
        if unsafe { ResumeThread(child.thread as HANDLE) } == u32::MAX {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PipeDirection {
    ParentReads,
    ParentWrites,
}

/// Create a pipe as `(parent, child)`: the parent end is overlapped and
/// private, the child end synchronous and inheritable.
fn create_pipe(direction: PipeDirection) -> io::Result<(OwnedHandle, OwnedHandle)> {
    let name = format!(
        r"\\.\pipe\procloop-{}-{}",
        std::process::id(),
        PIPE_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let name = to_wide_nul(OsStr::new(&name))?;

    let (open_mode, child_access) = match direction {
        PipeDirection::ParentReads => (PIPE_ACCESS_INBOUND, GENERIC_WRITE | FILE_WRITE_ATTRIBUTES),
        PipeDirection::ParentWrites => (PIPE_ACCESS_OUTBOUND, GENERIC_READ | FILE_WRITE_ATTRIBUTES),
    };

    // SAFETY: `name` is NUL-terminated; the returned handle is wrapped at once.
    let parent = unsafe {
        let handle = CreateNamedPipeW(
            name.as_ptr(),
            open_mode | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
            1,
            PIPE_BUFFER_SIZE,
            PIPE_BUFFER_SIZE,
            0,
            std::ptr::null(),
        );
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        OwnedHandle::from_raw_handle(handle)
    };

    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: 1,
    };
    // SAFETY: as above; `attributes` outlives the call.
    let child = unsafe {
        let handle = CreateFileW(
            name.as_ptr(),
            child_access,
            0,
            &attributes,
            OPEN_EXISTING,
            0,
            std::ptr::null_mut(),
        );
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        OwnedHandle::from_raw_handle(handle)
    };
    Ok((parent, child))
}

fn to_wide_nul(value: &OsStr) -> io::Result<Vec<u16>> {
    let mut wide: Vec<u16> = value.encode_wide().collect();
    if wide.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interior NUL in {:?}", value),
        ));
    }
    wide.push(0);
    Ok(wide)
}

/// Quote arguments the way the MSVC runtime parses them back.
fn make_command_line(command: &[OsString]) -> io::Result<Vec<u16>> {
    let mut line = Vec::new();
    for (i, arg) in command.iter().enumerate() {
        if i > 0 {
            line.push(b' ' as u16);
        }
        append_arg(&mut line, arg)?;
    }
    line.push(0);
    Ok(line)
}

fn append_arg(line: &mut Vec<u16>, arg: &OsStr) -> io::Result<()> {
    let wide: Vec<u16> = arg.encode_wide().collect();
    if wide.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interior NUL in argument {:?}", arg),
        ));
    }
    let quote = wide.is_empty() || wide.iter().any(|&c| c == b' ' as u16 || c == b'\t' as u16);
    if quote {
        line.push(b'"' as u16);
    }
    let mut backslashes = 0;
    for &c in &wide {
        if c == b'\\' as u16 {
            backslashes += 1;
        } else {
            if c == b'"' as u16 {
                line.extend(std::iter::repeat(b'\\' as u16).take(backslashes + 1));
            }
            backslashes = 0;
        }
        line.push(c);
    }
    if quote {
        line.extend(std::iter::repeat(b'\\' as u16).take(backslashes));
        line.push(b'"' as u16);
    }
    Ok(())
}

/// `KEY=VALUE\0...\0\0` in UTF-16.
fn make_environment_block(environment: &[(OsString, OsString)]) -> io::Result<Vec<u16>> {
    let mut block = Vec::new();
    for (key, value) in environment {
        let mut entry = key.clone();
        entry.push("=");
        entry.push(value);
        block.extend(to_wide_nul(&entry)?);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    Ok(block)
}

struct PortHandle(isize);

impl Drop for PortHandle {
    fn drop(&mut self) {
        // SAFETY: the port handle is owned and closed once.
        unsafe {
            CloseHandle(self.0 as HANDLE);
        }
    }
}

/// Wakes a [`CompletionPort`] with an empty packet on the wake token.
pub(crate) struct CompletionWaker {
    port: Arc<PortHandle>,
}

impl Waker for CompletionWaker {
    fn wake(&self) -> io::Result<()> {
        post(&self.port, WAKE_TOKEN)
    }
}

/// Queue an empty packet for `token`; `poll` reports it as readiness.
fn post(port: &PortHandle, token: u64) -> io::Result<()> {
    // SAFETY: posting a packet without an OVERLAPPED.
    let ok = unsafe { PostQueuedCompletionStatus(port.0 as HANDLE, 0, token as usize, std::ptr::null()) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One stream's staging buffer and its single in-flight operation.
struct PipeOp {
    overlapped: OVERLAPPED,
    buffer: Box<[u8]>,
    filled: usize,
    consumed: usize,
    pending: bool,
    eof: bool,
    error: Option<i32>,
}

impl PipeOp {
    fn new(size: usize) -> Box<Self> {
        Box::new(Self {
            // SAFETY: an all-zero OVERLAPPED is the documented initial state.
            overlapped: unsafe { std::mem::zeroed() },
            buffer: vec![0u8; size].into_boxed_slice(),
            filled: 0,
            consumed: 0,
            pending: false,
            eof: false,
            error: None,
        })
    }

    fn address(&self) -> usize {
        &self.overlapped as *const OVERLAPPED as usize
    }

    fn start_read(&mut self, raw: RawDescriptor) {
        self.filled = 0;
        self.consumed = 0;
        // SAFETY: the op is boxed and stays alive (registered or orphaned)
        // until its completion is dequeued.
        let ok = unsafe {
            self.overlapped = std::mem::zeroed();
            ReadFile(
                raw as HANDLE,
                self.buffer.as_mut_ptr(),
                self.buffer.len() as u32,
                std::ptr::null_mut(),
                &mut self.overlapped,
            )
        };
        if ok != 0 {
            self.pending = true;
            return;
        }
        // SAFETY: reading the calling thread's last error.
        match unsafe { GetLastError() } {
            ERROR_IO_PENDING => self.pending = true,
            ERROR_BROKEN_PIPE | ERROR_HANDLE_EOF => self.eof = true,
            code => self.error = Some(code as i32),
        }
    }
}

/// An I/O completion port with per-stream staging buffers.
pub(crate) struct CompletionPort {
    port: Arc<PortHandle>,
    staging_size: usize,
    ops: HashMap<u64, Box<PipeOp>>,
    // Cancelled operations whose completion has not been dequeued yet.
    orphans: HashMap<usize, Box<PipeOp>>,
}

impl CompletionPort {
    fn new(staging_size: usize) -> io::Result<Self> {
        // SAFETY: creating a fresh port.
        let port = unsafe {
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1)
        };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            port: Arc::new(PortHandle(port as isize)),
            staging_size: staging_size.max(1),
            ops: HashMap::new(),
            orphans: HashMap::new(),
        })
    }

    fn associate(&self, raw: RawDescriptor, token: u64) -> io::Result<()> {
        // SAFETY: `raw` is held open by the caller's descriptor guard.
        let port = unsafe {
            CreateIoCompletionPort(raw as HANDLE, self.port.0 as HANDLE, token as usize, 0)
        };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn complete(&mut self, token: u64, address: usize, bytes: u32, error: Option<u32>, events: &mut Vec<Readiness>) {
        if self.orphans.remove(&address).is_some() {
            return;
        }
        let Some(readiness) = decode_token(token) else { return };
        let Some(op) = self.ops.get_mut(&token) else { return };
        if op.address() != address {
            return;
        }
        op.pending = false;
        match error {
            None if readiness.stream != Stream::Stdin => op.filled = bytes as usize,
            None => {}
            Some(ERROR_BROKEN_PIPE | ERROR_HANDLE_EOF | ERROR_NO_DATA) if readiness.stream != Stream::Stdin => {
                op.eof = true
            }
            Some(ERROR_OPERATION_ABORTED) if readiness.stream != Stream::Stdin => op.eof = true,
            Some(code) => op.error = Some(code as i32),
        }
        events.push(readiness);
    }
}

impl Multiplexer for CompletionPort {
    type Waker = CompletionWaker;

    fn waker(&self) -> io::Result<CompletionWaker> {
        Ok(CompletionWaker {
            port: Arc::clone(&self.port),
        })
    }

    fn register_output(&mut self, key: ProcessKey, stream: Stream, raw: RawDescriptor) -> io::Result<()> {
        let token = token(key, stream);
        self.associate(raw, token)?;
        let mut op = PipeOp::new(self.staging_size);
        op.start_read(raw);
        self.ops.insert(token, op);
        Ok(())
    }

    fn arm_stdin(&mut self, key: ProcessKey, raw: RawDescriptor) -> io::Result<()> {
        let token = token(key, Stream::Stdin);
        if !self.ops.contains_key(&token) {
            self.associate(raw, token)?;
            self.ops.insert(token, PipeOp::new(self.staging_size));
        }
        let pending = self.ops.get(&token).map_or(false, |op| op.pending);
        if !pending {
            post(&self.port, token)?;
        }
        Ok(())
    }

    fn deregister(&mut self, key: ProcessKey, stream: Stream, raw: Option<RawDescriptor>) {
        let Some(op) = self.ops.remove(&token(key, stream)) else { return };
        if !op.pending {
            return;
        }
        if let Some(raw) = raw {
            // SAFETY: `raw` is open; `op.overlapped` is the in-flight operation.
            if unsafe { CancelIoEx(raw as HANDLE, &op.overlapped) } == 0 {
                trace!("CancelIoEx for {} of {} failed: {}", stream, key, io::Error::last_os_error());
            }
        }
        self.orphans.insert(op.address(), op);
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()> {
        let mut wait_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
        for _ in 0..EngineConfig::EVENT_BATCH_SIZE {
            let mut bytes = 0u32;
            let mut key = 0usize;
            let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
            // SAFETY: all out-parameters point to locals.
            let ok = unsafe {
                GetQueuedCompletionStatus(self.port.0 as HANDLE, &mut bytes, &mut key, &mut overlapped, wait_ms)
            };
            wait_ms = 0;

            if overlapped.is_null() {
                if ok == 0 {
                    // SAFETY: reading the calling thread's last error.
                    let code = unsafe { GetLastError() };
                    if code == WAIT_TIMEOUT {
                        return Ok(());
                    }
                    return Err(io::Error::from_raw_os_error(code as i32));
                }
                // Posted packet: a wake, or stdin armed while idle.
                if let Some(readiness) = decode_token(key as u64) {
                    events.push(readiness);
                }
                continue;
            }

            let error = if ok == 0 {
                // SAFETY: reading the calling thread's last error.
                Some(unsafe { GetLastError() })
            } else {
                None
            };
            self.complete(key as u64, overlapped as usize, bytes, error, events);
        }
        Ok(())
    }

    fn read(&mut self, key: ProcessKey, stream: Stream, raw: RawDescriptor, buf: &mut [u8]) -> io::Result<usize> {
        let token = token(key, stream);
        let op = self
            .ops
            .get_mut(&token)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        if op.consumed < op.filled {
            let count = (op.filled - op.consumed).min(buf.len());
            buf[..count].copy_from_slice(&op.buffer[op.consumed..op.consumed + count]);
            op.consumed += count;
            if op.consumed == op.filled {
                op.start_read(raw);
            } else {
                post(&self.port, token)?;
            }
            return Ok(count);
        }
        if let Some(code) = op.error.take() {
            return Err(io::Error::from_raw_os_error(code));
        }
        if op.eof {
            return Ok(0);
        }
        if !op.pending {
            op.start_read(raw);
            if op.eof {
                return Ok(0);
            }
        }
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn write(&mut self, key: ProcessKey, raw: RawDescriptor, buf: &[u8]) -> io::Result<usize> {
        let token = token(key, Stream::Stdin);
        if !self.ops.contains_key(&token) {
            self.associate(raw, token)?;
            self.ops.insert(token, PipeOp::new(self.staging_size));
        }
        let op = self
            .ops
            .get_mut(&token)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        if let Some(code) = op.error.take() {
            return Err(io::Error::from_raw_os_error(code));
        }
        if op.pending {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        let count = buf.len().min(op.buffer.len());
        op.buffer[..count].copy_from_slice(&buf[..count]);
        // SAFETY: the op is boxed and outlives the operation (registered or
        // orphaned until its completion is dequeued).
        let ok = unsafe {
            op.overlapped = std::mem::zeroed();
            WriteFile(
                raw as HANDLE,
                op.buffer.as_ptr(),
                count as u32,
                std::ptr::null_mut(),
                &mut op.overlapped,
            )
        };
        if ok != 0 {
            op.pending = true;
            return Ok(count);
        }
        // SAFETY: reading the calling thread's last error.
        match unsafe { GetLastError() } {
            ERROR_IO_PENDING => {
                op.pending = true;
                Ok(count)
            }
            ERROR_BROKEN_PIPE | ERROR_NO_DATA => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            code => Err(io::Error::from_raw_os_error(code as i32)),
        }
    }
}
