//! IPC wire protocol between applications and the service
//!
//! Requests and responses travel as single datagrams over a Unix domain
//! socket, each carrying one bincode-encoded envelope. File descriptors
//! (for pre-configured stream sockets) ride along as SCM_RIGHTS ancillary
//! data, never inside the payload.
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;

use anyhow::anyhow;
use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use serde::{Deserialize, Serialize};

use crate::error::{ResultExt, SystemError, TypedError, TypedResult};
use crate::stream::{
    Configuration, Hints, InterfaceConfiguration, ListenerConfiguration, MacAddress,
    StreamConfiguration, TrafficSpecification,
};

/// Filesystem path of the service endpoint
pub const SERVICE_SOCKET_PATH: &str = "/var/run/detd/detd_service.sock";

/// Bumped on every incompatible change to the message layout
pub const IPC_VERSION: u8 = 1;

/// One message must fit one datagram
pub const MAX_MESSAGE_SIZE: usize = 65507;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub interface: String,
    pub hints: Option<Hints>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamQosRequest {
    pub interface: String,
    /// Transmission interval in ns
    pub period: u64,
    /// Frame size in bytes
    pub size: u32,
    pub dmac: MacAddress,
    pub vid: u16,
    pub pcp: u8,
    pub txmin: u64,
    pub txmax: u64,
    pub setup_socket: bool,
    pub talker: bool,
    pub maddress: Option<MacAddress>,
    pub hints: Option<Hints>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamQosResponse {
    pub ok: bool,
    pub vlan_interface: String,
    pub socket_priority: u32,
}

impl StreamQosResponse {
    pub fn failure() -> Self {
        Self {
            ok: false,
            vlan_interface: String::new(),
            socket_priority: 0,
        }
    }
}

/// The discriminated union carried by every datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    InitRequest(InitRequest),
    InitResponse(InitResponse),
    StreamQosRequest(StreamQosRequest),
    StreamQosResponse(StreamQosResponse),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u8,
    message: Message,
}

impl Message {
    pub fn encode(&self) -> TypedResult<Vec<u8>> {
        let envelope = Envelope {
            version: IPC_VERSION,
            message: self.clone(),
        };
        let packet = bincode::serialize(&envelope).typ(SystemError::IpcMalformed)?;
        if packet.len() > MAX_MESSAGE_SIZE {
            return Err(TypedError::new(
                SystemError::IpcMalformed,
                anyhow!(
                    "Encoded message of {} bytes exceeds one datagram",
                    packet.len()
                ),
            ));
        }

        Ok(packet)
    }

    pub fn decode(packet: &[u8]) -> TypedResult<Self> {
        let envelope: Envelope = bincode::deserialize(packet).typ(SystemError::IpcMalformed)?;
        if envelope.version != IPC_VERSION {
            return Err(TypedError::new(
                SystemError::IpcMalformed,
                anyhow!(
                    "Protocol version mismatch: got {}, expected {IPC_VERSION}",
                    envelope.version
                ),
            ));
        }

        Ok(envelope.message)
    }
}

impl StreamQosRequest {
    pub fn from_talker(config: &Configuration, setup_socket: bool) -> Self {
        Self {
            interface: config.interface.clone(),
            period: config.traffic.interval,
            size: config.traffic.size,
            dmac: config.stream.addr,
            vid: config.stream.vid,
            pcp: config.stream.pcp,
            txmin: config.stream.txoffset,
            txmax: config.stream.txoffset,
            setup_socket,
            talker: true,
            maddress: None,
            hints: config.hints,
        }
    }

    pub fn from_listener(config: &ListenerConfiguration, setup_socket: bool) -> Self {
        Self {
            interface: config.interface.clone(),
            period: config.traffic.interval,
            size: config.traffic.size,
            dmac: config.stream.addr,
            vid: config.stream.vid,
            pcp: config.stream.pcp,
            txmin: config.stream.txoffset,
            txmax: config.stream.txoffset,
            setup_socket,
            talker: false,
            maddress: Some(config.maddress),
            hints: config.hints,
        }
    }

    /// Rebuilds the validated talker configuration on the receiving side.
    pub fn to_configuration(&self) -> TypedResult<Configuration> {
        let stream = StreamConfiguration::new(self.dmac, self.vid, self.pcp, self.txmin, None)?;
        let traffic = TrafficSpecification::new(self.period, self.size)?;

        Configuration::new(self.interface.clone(), stream, traffic, self.hints)
    }

    /// Rebuilds the validated listener configuration on the receiving side.
    pub fn to_listener_configuration(&self) -> TypedResult<ListenerConfiguration> {
        let maddress = self.maddress.ok_or_else(|| {
            TypedError::new(
                SystemError::IpcMalformed,
                anyhow!("Listener request without multicast address"),
            )
        })?;
        let stream = StreamConfiguration::new(self.dmac, self.vid, self.pcp, self.txmin, None)?;
        let traffic = TrafficSpecification::new(self.period, self.size)?;

        ListenerConfiguration::new(self.interface.clone(), stream, traffic, maddress, self.hints)
    }
}

impl InitRequest {
    pub fn to_interface_configuration(&self) -> InterfaceConfiguration {
        InterfaceConfiguration {
            interface: self.interface.clone(),
            hints: self.hints,
        }
    }
}

/// Sends one message, optionally to an explicit peer address (required on
/// unconnected sockets) and optionally attaching a file descriptor as
/// SCM_RIGHTS ancillary data.
pub fn send_message(
    socket: &UnixDatagram,
    message: &Message,
    addr: Option<&UnixAddr>,
    fd: Option<BorrowedFd>,
) -> TypedResult<()> {
    let packet = message.encode()?;
    let iov = [IoSlice::new(&packet)];

    let fds;
    let cmsgs: &[ControlMessage] = match &fd {
        Some(fd) => {
            fds = [fd.as_raw_fd()];
            &[ControlMessage::ScmRights(&fds)]
        }
        None => &[],
    };

    sendmsg(socket.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), addr)
        .typ(SystemError::Service)?;

    Ok(())
}

/// Receives one message, returning the sender address for the reply.
pub fn recv_message(socket: &UnixDatagram) -> TypedResult<(Message, UnixAddr)> {
    let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
    let mut iov = [IoSliceMut::new(&mut buffer)];

    let received = recvmsg::<UnixAddr>(socket.as_raw_fd(), &mut iov, None, MsgFlags::empty())
        .typ(SystemError::Service)?;
    let length = received.bytes;
    let addr = received.address.ok_or_else(|| {
        TypedError::new(
            SystemError::IpcMalformed,
            anyhow!("Datagram without sender address, reply impossible"),
        )
    })?;

    let message = Message::decode(&buffer[..length])?;

    Ok((message, addr))
}

/// Receives one message on a connected socket, together with a file
/// descriptor when the peer attached one.
pub fn recv_message_with_fd(socket: &UnixDatagram) -> TypedResult<(Message, Option<OwnedFd>)> {
    let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
    let mut iov = [IoSliceMut::new(&mut buffer)];
    let mut cmsg = cmsg_space!([RawFd; 1]);

    let received = recvmsg::<UnixAddr>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg),
        MsgFlags::empty(),
    )
    .typ(SystemError::Service)?;
    let length = received.bytes;

    let mut fd = None;
    for cmsg in received.cmsgs().typ(SystemError::Service)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            fd = fds.first().map(|fd| unsafe { OwnedFd::from_raw_fd(*fd) });
        }
    }

    let message = Message::decode(&buffer[..length])?;

    Ok((message, fd))
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::sys::stat::fstat;

    use super::*;

    fn qos_request() -> StreamQosRequest {
        StreamQosRequest {
            interface: "eth0".into(),
            period: 20_000_000,
            size: 1522,
            dmac: "7a:b9:ed:d6:d2:12".parse().unwrap(),
            vid: 3,
            pcp: 6,
            txmin: 250_000,
            txmax: 250_000,
            setup_socket: false,
            talker: true,
            maddress: None,
            hints: None,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let messages = [
            Message::InitRequest(InitRequest {
                interface: "eth0".into(),
                hints: Some(Hints::default()),
            }),
            Message::InitResponse(InitResponse { ok: true }),
            Message::StreamQosRequest(qos_request()),
            Message::StreamQosResponse(StreamQosResponse {
                ok: true,
                vlan_interface: "eth0.3".into(),
                socket_priority: 7,
            }),
        ];

        for message in messages {
            let packet = message.encode().unwrap();
            assert_eq!(Message::decode(&packet).unwrap(), message);
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let envelope = Envelope {
            version: IPC_VERSION + 1,
            message: Message::InitResponse(InitResponse { ok: true }),
        };
        let packet = bincode::serialize(&envelope).unwrap();

        let err = Message::decode(&packet).unwrap_err();
        assert_eq!(err.err(), SystemError::IpcMalformed);
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let packet = Message::InitResponse(InitResponse { ok: true })
            .encode()
            .unwrap();

        let err = Message::decode(&packet[..packet.len() - 1]).unwrap_err();
        assert_eq!(err.err(), SystemError::IpcMalformed);
    }

    #[test]
    fn talker_request_roundtrips_to_configuration() {
        let request = qos_request();
        let config = request.to_configuration().unwrap();

        assert_eq!(config.interface, "eth0");
        assert_eq!(config.stream.txoffset, 250_000);
        assert_eq!(config.traffic.interval, 20_000_000);
        assert_eq!(StreamQosRequest::from_talker(&config, false), request);
    }

    #[test]
    fn listener_request_requires_maddress() {
        let mut request = qos_request();
        request.talker = false;

        let err = request.to_listener_configuration().unwrap_err();
        assert_eq!(err.err(), SystemError::IpcMalformed);

        request.maddress = Some("01:00:5e:00:00:2a".parse().unwrap());
        assert!(request.to_listener_configuration().is_ok());
    }

    fn datagram_pair() -> (UnixDatagram, UnixDatagram) {
        use std::os::fd::IntoRawFd;

        let (left, right) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        unsafe {
            (
                UnixDatagram::from_raw_fd(left.into_raw_fd()),
                UnixDatagram::from_raw_fd(right.into_raw_fd()),
            )
        }
    }

    #[test]
    fn fd_travels_as_ancillary_data() {
        let (client, server) = datagram_pair();
        let payload = tempfile::tempfile().unwrap();

        let message = Message::StreamQosResponse(StreamQosResponse {
            ok: true,
            vlan_interface: "eth0.3".into(),
            socket_priority: 7,
        });
        send_message(&server, &message, None, Some(payload.as_fd())).unwrap();

        let (received, fd) = recv_message_with_fd(&client).unwrap();
        assert_eq!(received, message);

        let fd = fd.expect("ancillary fd");
        let sent = fstat(payload.as_raw_fd()).unwrap();
        let got = fstat(fd.as_raw_fd()).unwrap();
        assert_eq!((sent.st_dev, sent.st_ino), (got.st_dev, got.st_ino));
    }

    #[test]
    fn message_without_fd_yields_none() {
        let (client, server) = datagram_pair();

        let message = Message::InitResponse(InitResponse { ok: true });
        send_message(&server, &message, None, None).unwrap();

        let (received, fd) = recv_message_with_fd(&client).unwrap();
        assert_eq!(received, message);
        assert!(fd.is_none());
    }
}
