use std::path::Path;

use anyhow::Result;

use meshproxy_util::net::loopback_interface_name;
use meshproxy_util::resolv::{NameServers, parse_resolv_conf};

/// Host facts the pipeline needs. A trait seam so orchestration is
/// testable without a real network stack.
pub trait HostProbes {
    fn loopback_interface(&self) -> Result<String>;
    fn name_servers(&self, resolv_conf: &Path) -> Result<NameServers>;
}

pub struct RealProbes;

impl HostProbes for RealProbes {
    fn loopback_interface(&self) -> Result<String> {
        loopback_interface_name()
    }

    fn name_servers(&self, resolv_conf: &Path) -> Result<NameServers> {
        parse_resolv_conf(resolv_conf)
    }
}
