//! Connection startup: authentication negotiation and the parameter
//! collection phase.
use md5::{Digest, Md5};
use std::fmt::Write;

use super::{Connection, sasl::{SCRAM_SHA_256, ScramClient}};
use crate::{
    Result,
    postgres::{Authentication, ProtocolError, frontend},
    transport::{PgTransport, PgTransportExt},
};

/// The server requested an authentication scheme the driver does not
/// speak.
#[derive(Debug)]
pub struct UnsupportedAuth {
    scheme: String,
}

impl std::error::Error for UnsupportedAuth { }

impl std::fmt::Display for UnsupportedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unsupported authentication scheme: {}", self.scheme)
    }
}

/// Drive the startup flow to the first `ReadyForQuery`.
///
/// `ParameterStatus` and `BackendKeyData` frames arriving after
/// authentication are collected by the connection's receive routing; an
/// `ErrorResponse` anywhere in here fails the connect.
pub(super) async fn handshake(conn: &mut Connection) -> Result<()> {
    let config = conn.config.clone();

    conn.send_startup(frontend::Startup {
        user: &config.user,
        database: config.dbname.as_deref(),
        application_name: &config.application_name,
        options: &config.options,
    });
    conn.flush().await?;

    loop {
        match conn.recv::<Authentication>().await? {
            Authentication::Ok => break,
            Authentication::CleartextPassword => {
                conn.send(frontend::PasswordMessage { password: &config.pass });
                conn.flush().await?;
            },
            Authentication::MD5Password { salt } => {
                let hashed = md5_password(&config.user, &config.pass, salt);
                conn.send(frontend::PasswordMessage { password: &hashed });
                conn.flush().await?;
            },
            Authentication::SASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m.as_str() == SCRAM_SHA_256) {
                    let scheme = mechanisms
                        .iter()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>()
                        .join(",");
                    return Err(UnsupportedAuth { scheme }.into());
                }
                sasl_exchange(conn, &config.pass).await?;
            },
            other => {
                let scheme = format!("{other:?}");
                return Err(UnsupportedAuth { scheme }.into());
            },
        }
    }

    // the parameter reports and the cancellation key are consumed by
    // the receive routing on the way to ReadyForQuery
    conn.recv::<crate::postgres::backend::ReadyForQuery>().await?;

    tracing::debug!(
        user = config.user.as_str(),
        database = config.dbname.as_deref().unwrap_or(config.user.as_str()),
        "connection ready",
    );
    Ok(())
}

async fn sasl_exchange(conn: &mut Connection, password: &str) -> Result<()> {
    let mut scram = ScramClient::new(password);

    let first = scram.client_first();
    conn.send(frontend::SaslInitialResponse {
        mechanism: SCRAM_SHA_256,
        response: first.as_bytes(),
    });
    conn.flush().await?;

    let Authentication::SASLContinue { data } = conn.recv().await? else {
        return Err(ProtocolError::new("expected SASLContinue challenge").into());
    };
    let challenge = std::str::from_utf8(&data).map_err(ProtocolError::from)?;
    let client_final = scram.continue_with(challenge)?;

    conn.send(frontend::SaslResponse { data: client_final.as_bytes() });
    conn.flush().await?;

    let Authentication::SASLFinal { data } = conn.recv().await? else {
        return Err(ProtocolError::new("expected SASLFinal outcome").into());
    };
    let outcome = std::str::from_utf8(&data).map_err(ProtocolError::from)?;
    scram.verify_final(outcome)?;

    Ok(())
}

/// `"md5" || hex(md5(hex(md5(password || user)) || salt))`
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let inner = hex(&md5.finalize());

    let mut md5 = Md5::new();
    md5.update(inner.as_bytes());
    md5.update(salt);

    format!("md5{}", hex(&md5.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a string");
    }
    out
}
