//! Guest system plumbing: loopback bring-up and orphan reaping.

use crate::SupervisorError;
use cloister_transport::Transport;
use std::io;
use tracing::info;

/// Set `lo` up. The enclave kernel boots with every interface down, and the
/// forwarders and the user application all live on loopback. No-op on the
/// simulation backend, which runs on an already-configured host.
pub fn bring_loopback_up(transport: Transport) -> Result<(), SupervisorError> {
    if transport == Transport::Sim {
        return Ok(());
    }
    set_loopback_flags().map_err(SupervisorError::Loopback)?;
    info!("loopback up");
    Ok(())
}

fn set_loopback_flags() -> io::Result<()> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut ifr: libc::ifreq = std::mem::zeroed();
        for (dst, src) in ifr.ifr_name.iter_mut().zip(b"lo\0") {
            *dst = *src as libc::c_char;
        }

        if libc::ioctl(fd, libc::SIOCGIFFLAGS as _, &mut ifr) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        if libc::ioctl(fd, libc::SIOCSIFFLAGS as _, &mut ifr) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        libc::close(fd);
        Ok(())
    }
}

/// Whether this process carries init duties. Reaping is conditional on
/// actually being PID 1; under the simulation backend or in tests the
/// supervisor is an ordinary process and must not steal other children.
pub fn is_pid1() -> bool {
    std::process::id() == 1
}
