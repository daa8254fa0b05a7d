use zbus::names::OwnedUniqueName;

/// A classified peer address.
///
/// The broker hands out unique ids of the form `:1.<id>`. Anything else a
/// client can put into a `sender` or `destination` field is either a
/// well-known name or a `:`-prefixed string that can never resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Address<'a> {
    /// A broker-assigned unique id, `:1.<id>`.
    Id(u64),
    /// A well-known name (no leading `:`).
    Name(&'a str),
    /// `:`-prefixed but not a unique id; never resolves to a peer.
    Other,
}

impl<'a> Address<'a> {
    pub fn from_str(s: &'a str) -> Self {
        match s.strip_prefix(':') {
            None => Address::Name(s),
            Some(rest) => match rest.strip_prefix("1.") {
                Some(id) if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) => {
                    match id.parse() {
                        Ok(id) => Address::Id(id),
                        // Numerically out of range; can never be assigned.
                        Err(_) => Address::Other,
                    }
                }
                _ => Address::Other,
            },
        }
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            Address::Id(id) => Some(*id),
            _ => None,
        }
    }
}

/// The unique name assigned to the peer with the given id.
pub fn unique_name(id: u64) -> OwnedUniqueName {
    OwnedUniqueName::try_from(format!(":1.{id}")).unwrap()
}
