use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceAction {
    Up,
    Down,
}

/// The WireGuard control-plane RPC client, an abstracted collaborator.
/// Every call is treated as possibly failing; nothing here retries — wg
/// failures get zero local retries and surface directly to the caller.
#[async_trait]
pub trait WireGuardClient: Send + Sync {
    async fn initialize_interface(
        &self,
        address: &str,
        listen_port: u16,
        interface_name: &str,
        eth: &str,
    ) -> Result<()>;

    async fn manage_interface(&self, interface_name: &str, action: InterfaceAction) -> Result<()>;

    async fn gen_private_key(&self) -> Result<String>;
    async fn gen_public_key(&self, private_key: &str) -> Result<String>;
    async fn get_public_key(&self, interface_name: &str, key_alias: &str) -> Result<String>;
    async fn get_private_key(&self, interface_name: &str, key_alias: &str) -> Result<String>;

    async fn add_peer(
        &self,
        interface_name: &str,
        allowed_ips: &[String],
        public_key: &str,
        key_alias: &str,
    ) -> Result<()>;

    async fn del_peer(&self, interface_name: &str, public_key: &str, key_alias: &str)
    -> Result<()>;
}
