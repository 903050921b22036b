/// Address of a host service: a TCP port plus optional qualifiers.
///
/// The name and device serial are exchanged in the handshake. When both
/// sides carry a qualifier the values must match exactly.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct HostPort {
    pub port: u16,
    pub name: Option<String>,
    pub device_serial: Option<String>,
}

impl HostPort {
    pub fn new(port: u16) -> Self {
        Self { port, name: None, device_serial: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_device_serial(mut self, serial: impl Into<String>) -> Self {
        self.device_serial = Some(serial.into());
        self
    }

    /// Same qualifiers, different port number.
    pub(crate) fn with_port(&self, port: u16) -> Self {
        Self { port, ..self.clone() }
    }

    /// Whether a peer presenting `name`/`device` may connect to this port.
    pub fn qualifiers_match(&self, name: Option<&str>, device: Option<&str>) -> bool {
        fn agree(ours: Option<&str>, theirs: Option<&str>) -> bool {
            match (ours, theirs) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        agree(self.name.as_deref(), name) && agree(self.device_serial.as_deref(), device)
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port-{}", self.port)?;
        if let Some(name) = &self.name {
            write!(f, "/{}", name)?;
        }
        if let Some(serial) = &self.device_serial {
            write!(f, "@{}", serial)?;
        }
        Ok(())
    }
}
