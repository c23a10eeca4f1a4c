//! libssh2-backed [`RemoteSession`].
//!
//! Host keys are checked against the configured known_hosts files and an
//! unknown or mismatched key is a hard failure. DSA host keys are never
//! negotiated.

use super::remote::{CommandOutput, RemoteSession, RemoteStat};
use super::url::SshUrl;
use super::SshOptions;
use crate::error::{ConnectionError, SourceError};
use ssh2::{
    CheckResult, ErrorCode, ExtendedData, HashType, HostKeyType, KnownHostFileKind, MethodType,
    Session, Sftp,
};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, warn};

const HOST_KEY_ALGORITHMS: &str = "ssh-ed25519,ecdsa-sha2-nistp256,ecdsa-sha2-nistp384,\
ecdsa-sha2-nistp521,rsa-sha2-512,rsa-sha2-256,ssh-rsa";

const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

pub struct Ssh2Session {
    session: Session,
    sftp: Sftp,
    host: String,
}

impl Ssh2Session {
    pub fn connect(url: &SshUrl, options: &SshOptions) -> Result<Self, ConnectionError> {
        let host = url.host().to_string();
        let tcp = connect_tcp(url, options.connection_timeout)?;

        let session_err = |e: ssh2::Error| session_error(&host, e);

        let mut session = Session::new().map_err(session_err)?;
        session.set_timeout(options.connection_timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .method_pref(MethodType::HostKey, HOST_KEY_ALGORITHMS)
            .map_err(session_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(session_err)?;

        verify_host_key(&session, url, options)?;
        authenticate(&session, url, options)?;

        let sftp = session.sftp().map_err(session_err)?;
        debug!(host = %host, "SSH session established");

        Ok(Self {
            session,
            sftp,
            host,
        })
    }

    fn session_error(&self, e: ssh2::Error) -> SourceError {
        session_error(&self.host, e).into()
    }

    fn io_error(&self, e: io::Error) -> SourceError {
        ConnectionError::Session {
            host: self.host.clone(),
            reason: e.to_string(),
        }
        .into()
    }
}

impl RemoteSession for Ssh2Session {
    fn stat(&self, path: &str) -> Result<RemoteStat, SourceError> {
        let stat = self
            .sftp
            .stat(Path::new(path))
            .map_err(|e| self.file_error(path, e))?;
        Ok(RemoteStat {
            size: stat.size.unwrap_or(0),
            modified: stat.mtime.map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
        })
    }

    fn exec(&self, command: &str) -> Result<CommandOutput, SourceError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| self.session_error(e))?;
        // Unread stderr would fill the channel window and stall stdout.
        channel
            .handle_extended_data(ExtendedData::Ignore)
            .map_err(|e| self.session_error(e))?;
        channel.exec(command).map_err(|e| self.session_error(e))?;

        let mut stdout = Vec::new();
        channel
            .read_to_end(&mut stdout)
            .map_err(|e| self.io_error(e))?;

        channel.wait_close().map_err(|e| self.session_error(e))?;
        let exit_status = channel.exit_status().map_err(|e| self.session_error(e))?;

        Ok(CommandOutput {
            stdout,
            exit_status,
        })
    }

    fn open_file(&self, path: &str) -> Result<Box<dyn Read + Send>, SourceError> {
        let file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| self.file_error(path, e))?;
        Ok(Box::new(file))
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.session.disconnect(None, "closing", None) {
            debug!(host = %self.host, error = %e, "SSH disconnect failed");
        }
    }
}

impl Ssh2Session {
    /// Errors name the file only, never its directory.
    fn file_error(&self, path: &str, e: ssh2::Error) -> SourceError {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        match e.code() {
            ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => SourceError::NotFound { name },
            ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => SourceError::PermissionDenied { name },
            _ => self.session_error(e),
        }
    }
}

fn session_error(host: &str, e: ssh2::Error) -> ConnectionError {
    if e.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) {
        ConnectionError::Timeout {
            host: host.to_string(),
        }
    } else {
        ConnectionError::Session {
            host: host.to_string(),
            reason: e.message().to_string(),
        }
    }
}

fn connect_tcp(url: &SshUrl, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let host = url.host().to_string();
    let network = |reason: String| ConnectionError::Network {
        host: host.clone(),
        reason,
    };

    let addrs = (url.host(), url.port())
        .to_socket_addrs()
        .map_err(|e| network(e.to_string()))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(ConnectionError::Timeout { host: host.clone() })
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(network(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "host name did not resolve".to_string()),
    ))
}

fn verify_host_key(session: &Session, url: &SshUrl, options: &SshOptions) -> Result<(), ConnectionError> {
    let host = url.host();
    let (key, key_type) = session
        .host_key()
        .map(|(key, kind)| (key.to_vec(), kind))
        .ok_or_else(|| ConnectionError::Session {
            host: host.to_string(),
            reason: "server presented no host key".to_string(),
        })?;

    let rejected = || ConnectionError::HostKeyRejected {
        host: host.to_string(),
        key_type: key_type_name(key_type).to_string(),
        fingerprint: fingerprint(session),
    };

    if matches!(key_type, HostKeyType::Dss) {
        return Err(rejected());
    }

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| session_error(host, e))?;
    for file in options.known_hosts_files.iter().filter(|f| f.is_file()) {
        if let Err(e) = known_hosts.read_file(file, KnownHostFileKind::OpenSSH) {
            warn!(file = %file.display(), error = %e, "could not read known_hosts file");
        }
    }

    match known_hosts.check_port(host, url.port(), &key) {
        CheckResult::Match => Ok(()),
        _ => Err(rejected()),
    }
}

fn authenticate(session: &Session, url: &SshUrl, options: &SshOptions) -> Result<(), ConnectionError> {
    let user = url.user();

    if options.use_agent {
        if let Err(e) = session.userauth_agent(user) {
            debug!(error = %e, "agent authentication failed");
        }
    }

    for identity in options.identity_files.iter().filter(|f| f.is_file()) {
        if session.authenticated() {
            break;
        }
        if let Err(e) = session.userauth_pubkey_file(user, None, identity, None) {
            debug!(identity = %identity.display(), error = %e, "key authentication failed");
        }
    }

    if session.authenticated() {
        Ok(())
    } else {
        Err(ConnectionError::Authentication {
            host: url.host().to_string(),
        })
    }
}

fn key_type_name(kind: HostKeyType) -> &'static str {
    match kind {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Unknown => "unknown",
        _ => "ssh-ed25519",
    }
}

fn fingerprint(session: &Session) -> String {
    match session.host_key_hash(HashType::Sha256) {
        Some(hash) => format!("SHA256:{}", hex_pairs(hash)),
        None => "unavailable".to_string(),
    }
}

fn hex_pairs(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
