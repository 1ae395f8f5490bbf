//! Service lifecycle and request dispatch
//!
//! Construction acquires the single-instance lock and the IPC endpoint,
//! [`Service::run`] serves datagrams until terminated, and dropping the
//! service releases both on every exit path.
use std::fs;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use fslock::LockFile;
use nix::sys::socket::{setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, UnixAddr};
use polling::{Event, Events, Poller};
use signal_hook::consts::{SIGINT, SIGTERM};

use detd_core::check;
use detd_core::error::{ResultExt, SystemError, TypedError, TypedResult};
use detd_core::ipc::{self, InitRequest, InitResponse, Message, StreamQosRequest, StreamQosResponse};

use crate::manager::{Manager, StreamDetails};
use crate::systemconf::{
    LinuxSystemConfigurator, LinuxSystemInformation, MockSystemInformation,
    NoopSystemConfigurator, SystemConfigurator, SystemInformation,
};

const SERVICE_LOCK_FILE: &str = "/var/lock/detd";

/// When set, system effects are replaced with a no-op double and interface
/// facts are canned. Not a user-facing feature.
pub const TEST_MODE_ENV: &str = "DETD_TEST_MODE";

/// How often the main loop checks the termination flag
const POLL_PERIOD: Duration = Duration::from_millis(500);

pub struct Service {
    socket: UnixDatagram,
    socket_path: PathBuf,
    lock: LockFile,
    lock_path: PathBuf,
    manager: Manager,
    terminate: Arc<AtomicBool>,
    test_mode: bool,
}

impl Service {
    pub fn new() -> TypedResult<Self> {
        info!(" * * * detd service starting * * *");

        let test_mode = std::env::var_os(TEST_MODE_ENV).is_some();
        let (runner, sysinfo): (Arc<dyn SystemConfigurator>, Arc<dyn SystemInformation>) =
            if test_mode {
                warn!("Test mode: system configuration is not applied");
                (
                    Arc::new(NoopSystemConfigurator),
                    Arc::new(MockSystemInformation::default()),
                )
            } else {
                (
                    Arc::new(LinuxSystemConfigurator),
                    Arc::new(LinuxSystemInformation),
                )
            };

        let service = Self::with_paths(
            Path::new(ipc::SERVICE_SOCKET_PATH),
            Path::new(SERVICE_LOCK_FILE),
            runner,
            sysinfo,
            test_mode,
        )?;

        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, service.terminate.clone())
                .typ(SystemError::Service)?;
        }

        Ok(service)
    }

    fn with_paths(
        socket_path: &Path,
        lock_path: &Path,
        runner: Arc<dyn SystemConfigurator>,
        sysinfo: Arc<dyn SystemInformation>,
        test_mode: bool,
    ) -> TypedResult<Self> {
        // The lock file comes first: it is what makes this the only instance
        let mut lock = LockFile::open(lock_path).typ(SystemError::Service)?;
        if !lock.try_lock_with_pid().typ(SystemError::Service)? {
            return Err(TypedError::new(
                SystemError::Service,
                anyhow!("Another instance holds {}", lock_path.display()),
            ));
        }
        let _ = fs::set_permissions(lock_path, fs::Permissions::from_mode(0o400));

        let socket = Self::setup_endpoint(socket_path)?;

        Ok(Self {
            socket,
            socket_path: socket_path.to_path_buf(),
            lock,
            lock_path: lock_path.to_path_buf(),
            manager: Manager::new(runner, sysinfo),
            terminate: Arc::new(AtomicBool::new(false)),
            test_mode,
        })
    }

    fn setup_endpoint(socket_path: &Path) -> TypedResult<UnixDatagram> {
        let dir = socket_path.parent().ok_or_else(|| {
            TypedError::new(
                SystemError::Service,
                anyhow!("Endpoint {} has no parent directory", socket_path.display()),
            )
        })?;

        fs::create_dir_all(dir).typ(SystemError::Service)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).typ(SystemError::Service)?;

        // A leftover endpoint from an unclean shutdown would make bind fail
        if socket_path.exists() {
            if !check::is_valid_unix_domain_socket(socket_path) {
                return Err(TypedError::new(
                    SystemError::Service,
                    anyhow!("{} exists and is not a socket", socket_path.display()),
                ));
            }
            fs::remove_file(socket_path).typ(SystemError::Service)?;
        }

        UnixDatagram::bind(socket_path).typ(SystemError::Service)
    }

    /// Flag that breaks the main loop; shared with the signal handlers.
    pub fn terminate_handle(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    /// Serves requests until SIGINT/SIGTERM. Requests in flight complete
    /// normally.
    pub fn run(&mut self) -> TypedResult<()> {
        info!("Entering service main loop");

        let poller = Poller::new().typ(SystemError::Service)?;
        let mut events = Events::with_capacity(NonZeroUsize::MIN);
        unsafe {
            poller
                .add(self.socket.as_raw_fd(), Event::readable(0))
                .typ(SystemError::Service)?;
        }

        loop {
            if self.terminate.load(Ordering::Relaxed) {
                break;
            }

            poller
                .modify(self.socket.as_fd(), Event::readable(0))
                .typ(SystemError::Service)?;
            events.clear();

            match poller.wait(&mut events, Some(POLL_PERIOD)) {
                Ok(0) => continue,
                Ok(_) => self.handle_one(),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).typ(SystemError::Service),
            }
        }

        info!("Terminating service");
        Ok(())
    }

    fn handle_one(&self) {
        let (message, addr) = match ipc::recv_message(&self.socket) {
            Ok(received) => received,
            Err(e) => {
                // Without a decoded request there is no one to answer
                warn!("Dropping malformed datagram: {e}");
                return;
            }
        };

        debug!("Handling request");
        match message {
            Message::InitRequest(request) => self.handle_init(request, &addr),
            Message::StreamQosRequest(request) => self.handle_stream_qos(request, &addr),
            other => warn!("Ignoring unexpected message: {other:?}"),
        }
    }

    fn handle_init(&self, request: InitRequest, addr: &UnixAddr) {
        let ok = match self
            .manager
            .init_interface(&request.to_interface_configuration())
        {
            Ok(()) => true,
            Err(e) => {
                error!("Initializing {} failed: {e}", request.interface);
                false
            }
        };

        let response = Message::InitResponse(InitResponse { ok });
        if let Err(e) = ipc::send_message(&self.socket, &response, Some(addr), None) {
            error!("Sending the init response failed: {e}");
        }
    }

    fn handle_stream_qos(&self, request: StreamQosRequest, addr: &UnixAddr) {
        let (response, fd) = match self.process_stream_qos(&request) {
            Ok((details, fd)) => (
                StreamQosResponse {
                    ok: true,
                    vlan_interface: details.vlan_interface,
                    socket_priority: details.socket_priority,
                },
                fd,
            ),
            Err(e) => {
                error!("Stream reservation on {} failed: {e}", request.interface);
                if e.err() == SystemError::SystemInconsistent {
                    error!("System state is inconsistent, shutting down");
                    self.terminate.store(true, Ordering::Relaxed);
                }
                (StreamQosResponse::failure(), None)
            }
        };

        let response = Message::StreamQosResponse(response);
        let fd = fd.as_ref().map(|fd| fd.as_fd());
        if let Err(e) = ipc::send_message(&self.socket, &response, Some(addr), fd) {
            error!("Sending the QoS response failed: {e}");
        }
    }

    fn process_stream_qos(
        &self,
        request: &StreamQosRequest,
    ) -> TypedResult<(StreamDetails, Option<OwnedFd>)> {
        let details = if request.talker {
            self.manager.add_talker(&request.to_configuration()?)?
        } else {
            self.manager
                .add_listener(&request.to_listener_configuration()?)?
        };

        let fd = if request.setup_socket {
            Some(self.create_stream_socket(&details.vlan_interface, details.socket_priority)?)
        } else {
            None
        };

        Ok((details, fd))
    }

    /// Opens a UDP socket pre-configured for the reservation: the assigned
    /// priority set and bound to the VLAN interface. Ownership passes to the
    /// client via SCM_RIGHTS.
    fn create_stream_socket(&self, vlan_interface: &str, soprio: u32) -> TypedResult<OwnedFd> {
        let sock = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )
        .typ(SystemError::Service)?;

        if self.test_mode {
            // Priorities above 6 and device binds need CAP_NET_ADMIN
            setsockopt(&sock, sockopt::Priority, &6).typ(SystemError::Service)?;
            return Ok(sock);
        }

        setsockopt(&sock, sockopt::Priority, &(soprio as i32)).typ(SystemError::Service)?;
        setsockopt(
            &sock,
            sockopt::BindToDevice,
            &std::ffi::OsString::from(vlan_interface),
        )
        .typ(SystemError::Service)?;

        Ok(sock)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        info!("Cleaning up service");

        if check::is_valid_unix_domain_socket(&self.socket_path) {
            if let Err(e) = fs::remove_file(&self.socket_path) {
                error!("Removing {} failed: {e}", self.socket_path.display());
            }
        }

        if let Err(e) = self.lock.unlock() {
            error!("Releasing {} failed: {e}", self.lock_path.display());
        }
        if check::is_valid_file(&self.lock_path) {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                error!("Removing {} failed: {e}", self.lock_path.display());
            }
        }
    }
}
