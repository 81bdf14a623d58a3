//! The service opener: translates a high-level request into the correct
//! destination string for the peer's negotiated feature set, and opens it.

use crate::error::StreamError;
use crate::stream::Stream;
use crate::Connection;

/// What to install, as reported by the caller (a path or already-staged
/// package reference — this crate doesn't touch the local filesystem).
#[derive(Clone, Debug)]
pub struct InstallRequest {
    pub package_args: String,
}

/// A high-level request the [`Service`] opener knows how to translate.
#[derive(Clone, Debug)]
pub enum ServiceRequest<'a> {
    Shell(&'a str),
    InstallApk(&'a InstallRequest),
    MultiApkSession { package: &'a str, install_args: &'a str },
    Root,
    Unroot,
    Reboot(Option<&'a str>),
}

/// Opens the stream for a [`ServiceRequest`] against a [`Connection`],
/// picking the preferred destination when the peer advertises the
/// relevant feature and falling back otherwise.
pub struct Service;

impl Service {
    pub async fn open(connection: &Connection, request: ServiceRequest<'_>) -> Result<Stream, StreamError> {
        let destination = Self::destination(connection, &request);
        connection.open(&destination).await
    }

    /// Resolve `request` to the destination string that would be opened,
    /// without opening it. Exposed for callers that want to log or test
    /// the routing decision independently of I/O.
    pub fn destination(connection: &Connection, request: &ServiceRequest<'_>) -> String {
        match request {
            ServiceRequest::Shell(cmd) => {
                if connection.supports("shell_v2") {
                    format!("shell,v2,raw:{cmd}")
                } else {
                    format!("shell:{cmd}")
                }
            }
            ServiceRequest::InstallApk(install) => {
                if connection.supports("cmd") {
                    format!("exec:cmd package install {}", install.package_args)
                } else {
                    format!("exec:pm install {}", install.package_args)
                }
            }
            ServiceRequest::MultiApkSession { package, install_args } => {
                if connection.supports("abb_exec") {
                    format!("abb_exec:{package}\0install-create\0{install_args}")
                } else {
                    format!("exec:pm install-create {install_args}")
                }
            }
            ServiceRequest::Root => "root:".to_string(),
            ServiceRequest::Unroot => "unroot:".to_string(),
            ServiceRequest::Reboot(target) => match target {
                Some(t) => format!("reboot:{t}"),
                None => "reboot:".to_string(),
            },
        }
    }
}
