//! Simulated radio over UDP multicast.
//!
//! Every node on the host (or LAN) joins one multicast group, which plays
//! the shared air. Each frame travels in one datagram:
//!
//! ```text
//! 0..4  sender instance (u32 LE)
//! 4     next hop
//! 5     flags (bit 0 = broadcast)
//! 6..   frame
//! ```
//!
//! A node keeps datagrams sent to its own address or to the broadcast
//! address and ignores its own echoes. There is no link-layer ack, so a
//! unicast counts as sent once the datagram leaves the socket.

use crate::config::RadioConfig;
use crate::{component_debug, component_info};
use radionet_node::{Pipe, Transport};
use radionet_wire::{FrameBuf, BROADCAST_ADDRESS, MAX_MESSAGE_LENGTH};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

const DATAGRAM_HEADER: usize = 6;
const FLAG_BROADCAST: u8 = 0x01;

/// Decoded datagram
#[derive(Debug, PartialEq, Eq)]
struct Datagram<'a> {
    instance: u32,
    next_hop: u8,
    broadcast: bool,
    frame: &'a [u8],
}

fn encode_datagram(instance: u32, next_hop: u8, broadcast: bool, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATAGRAM_HEADER + frame.len());
    out.extend_from_slice(&instance.to_le_bytes());
    out.push(next_hop);
    out.push(if broadcast { FLAG_BROADCAST } else { 0 });
    out.extend_from_slice(frame);
    out
}

fn decode_datagram(bytes: &[u8]) -> Option<Datagram<'_>> {
    if bytes.len() < DATAGRAM_HEADER || bytes.len() > DATAGRAM_HEADER + MAX_MESSAGE_LENGTH {
        return None;
    }
    let instance = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Some(Datagram {
        instance,
        next_hop: bytes[4],
        broadcast: bytes[5] & FLAG_BROADCAST != 0,
        frame: &bytes[DATAGRAM_HEADER..],
    })
}

/// Node radio on a multicast group
pub struct UdpRadio {
    socket: UdpSocket,
    group: SocketAddrV4,
    instance: u32,
    address: u8,
    powered: bool,
}

impl UdpRadio {
    /// Join the group described by `config`
    pub fn open(config: &RadioConfig) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_loop_v4(true)?;
        socket.join_multicast_v4(&config.group, &config.interface)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port)))?;

        let instance = rand::random::<u32>();
        component_info!(
            "radio",
            "Joined {}:{} as instance {:08x}",
            config.group,
            config.port,
            instance
        );

        Ok(Self {
            socket: socket.into(),
            group: SocketAddrV4::new(config.group, config.port),
            instance,
            address: BROADCAST_ADDRESS,
            powered: true,
        })
    }

    /// Pipe a datagram arrives on, or `None` if it is not for us
    fn accept(&self, datagram: &Datagram<'_>) -> Option<Pipe> {
        if datagram.instance == self.instance {
            return None;
        }
        if datagram.broadcast || datagram.next_hop == BROADCAST_ADDRESS {
            Some(Pipe::Broadcast)
        } else if datagram.next_hop == self.address {
            Some(Pipe::Node)
        } else {
            None
        }
    }
}

impl Transport for UdpRadio {
    fn set_address(&mut self, address: u8) {
        component_debug!("radio", "Listening on address {}", address);
        self.address = address;
    }

    fn send(&mut self, next_hop: u8, frame: &[u8], broadcast: bool) -> bool {
        let datagram = encode_datagram(self.instance, next_hop, broadcast, frame);
        match self.socket.send_to(&datagram, self.group) {
            Ok(_) => true,
            Err(e) => {
                component_debug!("radio", "Send to {} failed: {}", next_hop, e);
                false
            }
        }
    }

    fn receive(&mut self) -> Option<(Pipe, FrameBuf)> {
        let mut buf = [0u8; DATAGRAM_HEADER + MAX_MESSAGE_LENGTH + 1];
        loop {
            let len = match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    component_debug!("radio", "Receive failed: {}", e);
                    return None;
                }
            };
            // A powered-down radio hears nothing
            if !self.powered {
                continue;
            }
            let Some(datagram) = decode_datagram(&buf[..len]) else {
                continue;
            };
            if let Some(pipe) = self.accept(&datagram) {
                return Some((pipe, FrameBuf::from_slice(datagram.frame)));
            }
        }
    }

    fn power_down(&mut self) {
        self.powered = false;
    }

    fn power_up(&mut self) {
        self.powered = true;
    }
}
