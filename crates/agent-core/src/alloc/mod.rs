//! Resource allocators: ephemeral RDP ports, VPN endpoint UDP ports,
//! per-environment VPN host octets, and the global VPN host-prefix pool.
//!
//! Each allocator follows the same shape: a pure function computing the
//! next value, wrapped by a thin async layer that does the actual OS
//! probing or pool bookkeeping.

pub mod host_prefix;
pub mod lab_octet;
pub mod lab_subnet;
pub mod rdp_port;
pub mod vpn_ip;
pub mod vpn_port;

pub use host_prefix::{HostPrefix, HostPrefixPool};
pub use lab_octet::LabOctetPool;
pub use lab_subnet::{LabSubnet, LabSubnetPool};
pub use rdp_port::allocate_rdp_port;
pub use vpn_ip::VpnIpPool;
pub use vpn_port::allocate_vpn_port;
