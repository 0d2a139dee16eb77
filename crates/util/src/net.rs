use anyhow::{Context, Result, anyhow};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

/// Name of the first interface whose flags include loopback.
pub fn loopback_interface_name() -> Result<String> {
    let addrs = getifaddrs().context("failed to list network interfaces")?;
    for ifaddr in addrs {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            return Ok(ifaddr.interface_name);
        }
    }
    Err(anyhow!("no loopback interface"))
}

/// First interface that is up and not loopback. Used for tc attachment.
pub fn non_loopback_interface_name() -> Result<String> {
    let addrs = getifaddrs().context("failed to list network interfaces")?;
    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
            && ifaddr.flags.contains(InterfaceFlags::IFF_UP)
        {
            return Ok(ifaddr.interface_name);
        }
    }
    Err(anyhow!("cannot find an interface other than loopback"))
}

pub fn interface_is_up(name: &str) -> bool {
    let Ok(addrs) = getifaddrs() else {
        return false;
    };
    for ifaddr in addrs {
        if ifaddr.interface_name == name && ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_exists_on_linux() {
        let name = loopback_interface_name().unwrap();
        assert!(!name.is_empty());
    }

    #[test]
    fn loopback_is_up() {
        let name = loopback_interface_name().unwrap();
        assert!(interface_is_up(&name));
    }

    #[test]
    fn unknown_interface_is_not_up() {
        assert!(!interface_is_up("definitely-not-an-iface"));
    }
}
