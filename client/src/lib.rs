//! Client stub for the detd service
//!
//! Talker and listener applications use [`ServiceProxy`] to submit their
//! stream description and receive back the VLAN interface and socket
//! priority to use, optionally together with a pre-configured socket.
#[macro_use]
extern crate log;

use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use nix::sys::socket::{bind, UnixAddr};
use polling::{Event, Events, Poller};

use detd_core::check;
use detd_core::error::{ResultExt, SystemError, TypedError, TypedResult};
use detd_core::ipc::{self, InitRequest, Message, StreamQosRequest};
use detd_core::stream::{Configuration, InterfaceConfiguration, ListenerConfiguration};

/// System configuration may involve slow driver paths, so allow the service
/// plenty of time before giving up on a response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct ServiceProxy {
    socket: UnixDatagram,
}

impl ServiceProxy {
    /// Connects to the service at its well-known endpoint.
    pub fn connect() -> TypedResult<Self> {
        Self::connect_to(Path::new(ipc::SERVICE_SOCKET_PATH))
    }

    /// Connects to a service at an explicit endpoint path.
    pub fn connect_to(path: &Path) -> TypedResult<Self> {
        // Reject endpoints somebody replaced or hardlinked
        if !check::is_valid_unix_domain_socket(path) {
            return Err(TypedError::new(
                SystemError::InvalidArgument,
                anyhow!("{} is not a valid service endpoint", path.display()),
            ));
        }

        let socket = UnixDatagram::unbound().typ(SystemError::Service)?;
        // Autobind, so the service has an address to reply to
        bind(socket.as_raw_fd(), &UnixAddr::new_unnamed()).typ(SystemError::Service)?;
        socket.connect(path).typ(SystemError::Service)?;

        trace!("Connected to {}", path.display());
        Ok(Self { socket })
    }

    /// Asks the service to pre-configure an interface and pin its hints.
    pub fn init_interface(&self, config: &InterfaceConfiguration) -> TypedResult<()> {
        let request = Message::InitRequest(InitRequest {
            interface: config.interface.clone(),
            hints: config.hints,
        });

        match self.transact(&request)? {
            (Message::InitResponse(response), _) if response.ok => Ok(()),
            (Message::InitResponse(_), _) => Err(Self::service_error("interface init")),
            _ => Err(Self::unexpected_response()),
        }
    }

    /// Reserves a talker stream. Returns the VLAN interface to send on and
    /// the socket priority to attach to outgoing packets.
    pub fn add_talker(&self, config: &Configuration) -> TypedResult<(String, u32)> {
        let request = Message::StreamQosRequest(StreamQosRequest::from_talker(config, false));
        self.stream_qos(&request, "add talker").map(|(details, _)| details)
    }

    /// Like [`ServiceProxy::add_talker`], but the service also opens a
    /// socket pre-configured with the assigned priority and hands it over.
    pub fn add_talker_socket(&self, config: &Configuration) -> TypedResult<OwnedFd> {
        let request = Message::StreamQosRequest(StreamQosRequest::from_talker(config, true));
        let (_, fd) = self.stream_qos(&request, "add talker socket")?;

        fd.ok_or_else(|| {
            TypedError::new(
                SystemError::IpcMalformed,
                anyhow!("Service did not attach the stream socket"),
            )
        })
    }

    /// Reserves a listener stream.
    pub fn add_listener(&self, config: &ListenerConfiguration) -> TypedResult<(String, u32)> {
        let request = Message::StreamQosRequest(StreamQosRequest::from_listener(config, false));
        self.stream_qos(&request, "add listener").map(|(details, _)| details)
    }

    /// Like [`ServiceProxy::add_listener`], with a pre-configured socket
    /// handed over.
    pub fn add_listener_socket(&self, config: &ListenerConfiguration) -> TypedResult<OwnedFd> {
        let request = Message::StreamQosRequest(StreamQosRequest::from_listener(config, true));
        let (_, fd) = self.stream_qos(&request, "add listener socket")?;

        fd.ok_or_else(|| {
            TypedError::new(
                SystemError::IpcMalformed,
                anyhow!("Service did not attach the stream socket"),
            )
        })
    }

    fn stream_qos(
        &self,
        request: &Message,
        operation: &str,
    ) -> TypedResult<((String, u32), Option<OwnedFd>)> {
        match self.transact(request)? {
            (Message::StreamQosResponse(response), fd) if response.ok => {
                Ok(((response.vlan_interface, response.socket_priority), fd))
            }
            (Message::StreamQosResponse(_), _) => Err(Self::service_error(operation)),
            _ => Err(Self::unexpected_response()),
        }
    }

    fn transact(&self, request: &Message) -> TypedResult<(Message, Option<OwnedFd>)> {
        ipc::send_message(&self.socket, request, None, None)?;
        self.wait_response(RESPONSE_TIMEOUT)?;

        ipc::recv_message_with_fd(&self.socket)
    }

    fn wait_response(&self, timeout: Duration) -> TypedResult<()> {
        let start = Instant::now();

        let poller = Poller::new().typ(SystemError::Service)?;
        let mut events = Events::with_capacity(NonZeroUsize::MIN);
        unsafe {
            poller
                .add(self.socket.as_raw_fd(), Event::readable(0))
                .typ(SystemError::Service)?;
        }

        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            match poller.wait(&mut events, Some(remaining)) {
                Ok(0) => {
                    return Err(TypedError::new(
                        SystemError::Service,
                        anyhow!("Service did not respond within {timeout:?}"),
                    ))
                }
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).typ(SystemError::Service),
            }
        }
    }

    fn service_error(operation: &str) -> TypedError {
        TypedError::new(
            SystemError::Service,
            anyhow!("Service replied with an error on {operation}"),
        )
    }

    fn unexpected_response() -> TypedError {
        TypedError::new(
            SystemError::IpcMalformed,
            anyhow!("Unexpected response message type"),
        )
    }
}

/// Well-known endpoint, re-exported for applications that probe for the
/// service before connecting.
pub fn service_socket_path() -> PathBuf {
    PathBuf::from(ipc::SERVICE_SOCKET_PATH)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use detd_core::ipc::{InitResponse, StreamQosResponse};
    use detd_core::stream::{StreamConfiguration, TrafficSpecification};

    use super::*;

    fn talker_config() -> Configuration {
        let stream = StreamConfiguration::new(
            "7a:b9:ed:d6:d2:12".parse().unwrap(),
            3,
            6,
            250_000,
            None,
        )
        .unwrap();
        let traffic = TrafficSpecification::new(20_000_000, 1522).unwrap();
        Configuration::new("eth0".into(), stream, traffic, None).unwrap()
    }

    /// One-shot fake service answering each request with a canned response.
    fn serve_one(server: UnixDatagram, response: Message) -> thread::JoinHandle<Message> {
        thread::spawn(move || {
            let (request, addr) = ipc::recv_message(&server).unwrap();
            ipc::send_message(&server, &response, Some(&addr), None).unwrap();
            request
        })
    }

    #[test]
    fn endpoint_is_verified_before_connecting() {
        let dir = tempfile::tempdir().unwrap();

        // Missing path
        let err = ServiceProxy::connect_to(&dir.path().join("nope.sock")).unwrap_err();
        assert_eq!(err.err(), SystemError::InvalidArgument);

        // Present but not a socket
        let file = dir.path().join("plain");
        std::fs::write(&file, "").unwrap();
        let err = ServiceProxy::connect_to(&file).unwrap_err();
        assert_eq!(err.err(), SystemError::InvalidArgument);
    }

    #[test]
    fn add_talker_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detd.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let response = Message::StreamQosResponse(StreamQosResponse {
            ok: true,
            vlan_interface: "eth0.3".into(),
            socket_priority: 7,
        });
        let handle = serve_one(server, response);

        let proxy = ServiceProxy::connect_to(&path).unwrap();
        let (vlan_interface, soprio) = proxy.add_talker(&talker_config()).unwrap();

        assert_eq!(vlan_interface, "eth0.3");
        assert_eq!(soprio, 7);

        // The service saw the stream parameters we sent
        match handle.join().unwrap() {
            Message::StreamQosRequest(request) => {
                assert!(request.talker);
                assert!(!request.setup_socket);
                assert_eq!(request.vid, 3);
                assert_eq!(request.txmin, 250_000);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn service_error_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detd.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let handle = serve_one(
            server,
            Message::StreamQosResponse(StreamQosResponse::failure()),
        );

        let proxy = ServiceProxy::connect_to(&path).unwrap();
        let err = proxy.add_talker(&talker_config()).unwrap_err();
        assert_eq!(err.err(), SystemError::Service);

        handle.join().unwrap();
    }

    #[test]
    fn unexpected_response_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detd.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let handle = serve_one(server, Message::InitResponse(InitResponse { ok: true }));

        let proxy = ServiceProxy::connect_to(&path).unwrap();
        let err = proxy.add_talker(&talker_config()).unwrap_err();
        assert_eq!(err.err(), SystemError::IpcMalformed);

        handle.join().unwrap();
    }

    #[test]
    fn init_interface_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detd.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let handle = serve_one(server, Message::InitResponse(InitResponse { ok: true }));

        let proxy = ServiceProxy::connect_to(&path).unwrap();
        proxy
            .init_interface(&InterfaceConfiguration {
                interface: "eth0".into(),
                hints: None,
            })
            .unwrap();

        match handle.join().unwrap() {
            Message::InitRequest(request) => assert_eq!(request.interface, "eth0"),
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
