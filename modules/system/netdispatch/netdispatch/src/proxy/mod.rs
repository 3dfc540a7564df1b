//! HTTP proxy support: `CONNECT` tunnels opened at connect time, switchable
//! at runtime.

mod client;
mod connector;
mod dispatcher;

pub use client::ProxyClient;
pub use connector::ProxyConnector;
pub use dispatcher::{
    ProxyDispatcher, ProxySettingController, ProxySettings, reject_proxy_authorization,
};
