use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use tracing::{debug, info, warn};

use crate::compose::ComposeFile;
use crate::domain::Instance;
use crate::error::FleetError;

/// Answers whether something on this host already listens on a port.
pub trait PortProbe {
    fn in_use(&self, port: u16) -> bool;
}

/// Probes by trying to bind the wildcard address.
pub struct SocketProbe;

impl PortProbe for SocketProbe {
    fn in_use(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).is_err()
    }
}

pub struct PortAllocator<'a, P: PortProbe> {
    pub floor: u16,
    pub ceiling: u16,
    pub attempts: u32,
    pub probe: &'a P,
}

/// Published host ports of every instance config that can be read.
pub fn declared_ports(instances: &[Instance]) -> HashSet<u16> {
    let mut ports = HashSet::new();
    for inst in instances {
        match ComposeFile::load(&inst.config_path()) {
            Ok(doc) => ports.extend(doc.published_ports()),
            Err(e) => warn!(instance = %inst.name, error = %e, "skipping unreadable config"),
        }
    }
    ports
}

impl<P: PortProbe> PortAllocator<'_, P> {
    /// Next free port above every declared one.
    pub fn allocate(&self, declared: &HashSet<u16>) -> anyhow::Result<u16> {
        let highest = declared
            .iter()
            .copied()
            .filter(|p| *p >= self.floor)
            .max()
            .unwrap_or(self.floor);
        let mut candidate = u32::from(highest) + 1;
        for _ in 0..self.attempts {
            if candidate > u32::from(self.ceiling) {
                break;
            }
            let port = candidate as u16;
            if declared.contains(&port) {
                debug!(port, "port declared by another instance");
            } else if self.probe.in_use(port) {
                debug!(port, "port bound by a live listener");
            } else {
                info!(port, "allocated port");
                return Ok(port);
            }
            candidate += 1;
        }
        Err(FleetError::ResourceExhausted(format!(
            "no free port in ({}, {}] after scanning from {}",
            self.floor,
            self.ceiling,
            u32::from(highest) + 1
        ))
        .into())
    }
}
