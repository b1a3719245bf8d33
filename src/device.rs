use anyhow::Result;
use get_if_addrs::{get_if_addrs, IfAddr};

pub fn list_interfaces() -> Result<()> {
    for iface in get_if_addrs()? {
        let addr = match iface.addr {
            IfAddr::V4(a) => a.ip.to_string(),
            IfAddr::V6(a) => a.ip.to_string(),
        };
        println!("{}\t{}", iface.name, addr);
    }
    Ok(())
}
