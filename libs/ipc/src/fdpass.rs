//! Descriptor Passing
//!
//! Shared-listen responses carry an open socket descriptor alongside the
//! frame, as SCM_RIGHTS ancillary data on the same datagram. These helpers
//! wrap `sendmsg`/`recvmsg` behind tokio's readiness loop so the rest of the
//! crate can stay on `tokio::net::UnixDatagram`.

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use tokio::io::Interest;
use tokio::net::UnixDatagram;

fn nix_to_io(err: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Send one frame to `dest`, attaching `fd` as SCM_RIGHTS when present
pub async fn send_to(
    socket: &UnixDatagram,
    frame: &[u8],
    fd: Option<BorrowedFd<'_>>,
    dest: &Path,
) -> io::Result<usize> {
    let addr = UnixAddr::new(dest).map_err(nix_to_io)?;
    let raw = socket.as_raw_fd();

    socket
        .async_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(frame)];
            match &fd {
                Some(fd) => {
                    let fds = [fd.as_raw_fd()];
                    let cmsgs = [ControlMessage::ScmRights(&fds)];
                    sendmsg(raw, &iov, &cmsgs, MsgFlags::empty(), Some(&addr))
                }
                None => sendmsg(raw, &iov, &[], MsgFlags::empty(), Some(&addr)),
            }
            .map_err(nix_to_io)
        })
        .await
}

/// Receive one frame, returning any descriptor that rode along with it
pub async fn recv_from(
    socket: &UnixDatagram,
    buf: &mut [u8],
) -> io::Result<(usize, Option<OwnedFd>)> {
    let raw = socket.as_raw_fd();

    socket
        .async_io(Interest::READABLE, || {
            let mut iov = [IoSliceMut::new(&mut buf[..])];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
            let msg = recvmsg::<UnixAddr>(
                raw,
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .map_err(nix_to_io)?;

            let mut passed = None;
            for cmsg in msg.cmsgs().map_err(nix_to_io)? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    if let Some(&fd) = fds.first() {
                        // SAFETY: the kernel just installed this descriptor
                        // into our table for us; we are its only owner.
                        passed = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
            Ok((msg.bytes, passed))
        })
        .await
}
