use enumflags2::{bitflags, BitFlags};

pub use zbus::message::Type as MessageType;

/// Header flags, as decoded by the wire codec.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderFlag {
    NoReplyExpected = 0x1,
    NoAutoStart = 0x2,
    AllowInteractiveAuthorization = 0x4,
}

/// The decoded header fields the routing layer consults.
#[derive(Clone, Debug)]
pub struct Header {
    pub ty: MessageType,
    pub flags: BitFlags<HeaderFlag>,
    pub serial: u32,
    pub reply_serial: Option<u32>,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
}

/// One decoded body argument.
///
/// Only string and object-path values take part in match filtering; every
/// other element type is opaque to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    Str(String),
    ObjectPath(String),
    Other,
}

/// Decoded message metadata, as handed over by the wire codec.
#[derive(Clone, Debug)]
pub struct Message {
    pub header: Header,
    /// Leading body arguments, at most [`crate::match_rules::MAX_ARGS`].
    pub args: Vec<Arg>,
    /// Serialized size on the wire, for byte accounting.
    pub size: usize,
}

impl Message {
    fn new(ty: MessageType, serial: u32, sender: &str) -> Self {
        Self {
            header: Header {
                ty,
                flags: BitFlags::empty(),
                serial,
                reply_serial: None,
                sender: Some(sender.to_string()),
                destination: None,
                interface: None,
                member: None,
                path: None,
            },
            args: vec![],
            size: 0,
        }
    }

    pub fn method_call(
        serial: u32,
        sender: &str,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Self {
        let mut msg = Self::new(MessageType::MethodCall, serial, sender);
        msg.header.destination = Some(destination.to_string());
        msg.header.path = Some(path.to_string());
        msg.header.interface = Some(interface.to_string());
        msg.header.member = Some(member.to_string());
        msg.update_size()
    }

    pub fn method_return(serial: u32, sender: &str, destination: &str, reply_serial: u32) -> Self {
        let mut msg = Self::new(MessageType::MethodReturn, serial, sender);
        msg.header.destination = Some(destination.to_string());
        msg.header.reply_serial = Some(reply_serial);
        msg.update_size()
    }

    pub fn error(serial: u32, sender: &str, destination: &str, reply_serial: u32) -> Self {
        let mut msg = Self::new(MessageType::Error, serial, sender);
        msg.header.destination = Some(destination.to_string());
        msg.header.reply_serial = Some(reply_serial);
        msg.update_size()
    }

    pub fn signal(serial: u32, sender: &str, path: &str, interface: &str, member: &str) -> Self {
        let mut msg = Self::new(MessageType::Signal, serial, sender);
        msg.header.path = Some(path.to_string());
        msg.header.interface = Some(interface.to_string());
        msg.header.member = Some(member.to_string());
        msg.update_size()
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.header.destination = Some(destination.to_string());
        self.update_size()
    }

    pub fn with_flags(mut self, flags: BitFlags<HeaderFlag>) -> Self {
        self.header.flags = flags;
        self
    }

    pub fn with_args(mut self, args: Vec<Arg>) -> Self {
        self.args = args;
        self.update_size()
    }

    /// Whether the sender expects a reply to this message.
    pub fn expects_reply(&self) -> bool {
        self.header.ty == MessageType::MethodCall
            && !self.header.flags.contains(HeaderFlag::NoReplyExpected)
    }

    // The codec reports the exact wire size; stand-alone construction
    // estimates it from the header fields and decoded args.
    fn update_size(mut self) -> Self {
        let hdr = &self.header;
        let fields = [&hdr.sender, &hdr.destination, &hdr.interface, &hdr.member, &hdr.path];
        self.size = 16
            + fields.iter().filter_map(|f| f.as_deref()).map(|f| f.len() + 8).sum::<usize>()
            + self
                .args
                .iter()
                .map(|a| match a {
                    Arg::Str(s) | Arg::ObjectPath(s) => s.len() + 8,
                    Arg::Other => 8,
                })
                .sum::<usize>();
        self
    }
}
