//! Peer credential acquisition.

/// Credentials of one connected peer, as obtained from its socket.
#[derive(Clone, Debug, Default)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<u32>,
    /// Security label; empty when the transport carries none.
    pub seclabel: String,
    /// Primary gid first, auxiliary groups after (only resolved when
    /// group-based policy is in use).
    pub groups: Vec<u32>,
}

impl PeerCredentials {
    pub fn for_uid(uid: u32) -> Self {
        Self { uid, ..Default::default() }
    }
}

#[cfg(unix)]
mod unix {
    use std::{
        ffi::CString,
        io,
        os::fd::{AsFd, AsRawFd},
        sync::Once,
    };

    use nix::{
        sys::socket::{getsockopt, sockopt},
        unistd::{getgrouplist, Gid, Uid, User},
    };
    use tracing::warn;

    use super::PeerCredentials;

    impl PeerCredentials {
        /// Reads the peer credentials off a connected unix socket.
        ///
        /// Auxiliary groups are resolved only on request, preferably via
        /// `SO_PEERGROUPS`; on kernels without it the password database is
        /// consulted instead, which is racy and warned about once.
        pub fn from_socket(socket: &impl AsFd, want_groups: bool) -> io::Result<Self> {
            let ucred = getsockopt(socket, sockopt::PeerCredentials).map_err(io_err)?;
            let (uid, gid) = (ucred.uid(), ucred.gid());
            let pid = u32::try_from(ucred.pid()).ok().filter(|&pid| pid != 0);
            let seclabel = peer_seclabel(socket)?;
            let groups =
                if want_groups { peer_groups(socket, uid, gid)? } else { vec![gid] };
            Ok(Self { uid, gid, pid, seclabel, groups })
        }
    }

    fn io_err(errno: nix::errno::Errno) -> io::Error {
        io::Error::from_raw_os_error(errno as i32)
    }

    #[cfg(target_os = "linux")]
    fn peer_seclabel(socket: &impl AsFd) -> io::Result<String> {
        let fd = socket.as_fd().as_raw_fd();
        let mut buf = vec![0u8; 1024];
        loop {
            let mut len = buf.len() as libc::socklen_t;
            let r = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_PEERSEC,
                    buf.as_mut_ptr().cast(),
                    &mut len,
                )
            };
            if r == 0 {
                buf.truncate(len as usize);
                while buf.last() == Some(&0) {
                    buf.pop();
                }
                return Ok(String::from_utf8_lossy(&buf).into_owned());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // no LSM label on this socket
                Some(libc::ENOPROTOOPT) | Some(libc::EOPNOTSUPP) | Some(libc::EINVAL) => {
                    return Ok(String::new())
                }
                Some(libc::ERANGE) => buf.resize(len as usize + 1, 0),
                _ => return Err(err),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn peer_seclabel(_socket: &impl AsFd) -> io::Result<String> {
        Ok(String::new())
    }

    #[cfg(target_os = "linux")]
    fn peergroups_sockopt(fd: i32) -> io::Result<Option<Vec<u32>>> {
        let mut buf: Vec<libc::gid_t> = vec![0; 64];
        loop {
            let mut len = std::mem::size_of_val(buf.as_slice()) as libc::socklen_t;
            let r = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_PEERGROUPS,
                    buf.as_mut_ptr().cast(),
                    &mut len,
                )
            };
            let n_gids = len as usize / std::mem::size_of::<libc::gid_t>();
            if r == 0 {
                buf.truncate(n_gids);
                return Ok(Some(buf));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ERANGE) => buf.resize(n_gids, 0),
                Some(libc::ENOPROTOOPT) => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    fn peer_groups(socket: &impl AsFd, uid: u32, gid: u32) -> io::Result<Vec<u32>> {
        #[cfg(target_os = "linux")]
        if let Some(mut groups) = peergroups_sockopt(socket.as_fd().as_raw_fd())? {
            groups.insert(0, gid);
            return Ok(groups);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = socket;

        static WARNED: Once = Once::new();
        WARNED.call_once(|| {
            warn!(
                "falling back to resolving auxiliary groups via the password database, \
                 this is racy and may cause deadlocks; update to a kernel with \
                 SO_PEERGROUPS support"
            );
        });

        let user = User::from_uid(Uid::from_raw(uid))
            .map_err(io_err)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown peer uid"))?;
        let name = CString::new(user.name).map_err(io::Error::other)?;
        let groups = getgrouplist(&name, Gid::from_raw(gid)).map_err(io_err)?;
        Ok(groups.into_iter().map(Gid::as_raw).collect())
    }

}
