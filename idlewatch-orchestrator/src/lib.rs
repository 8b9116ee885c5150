pub mod idle_pass;
pub mod inventory;
pub mod pool;
pub mod probe;
pub mod provider_manager;
pub mod remote;
pub mod settings;
pub mod shutdown;
pub mod summary;
