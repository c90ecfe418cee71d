//! Shared request pipeline for line-based text protocols.

use crate::handler::{HandlerError, Outcome, Payload, ProtocolHandler, Request};
use crate::net::connection::{Connection, ConnectionState};

/// Read → Parse → Process → Write for one connection.
pub async fn serve_conn<H>(handler: &H, conn: &mut Connection) -> Result<(), HandlerError>
where
    H: ProtocolHandler + ?Sized,
{
    conn.set_state(ConnectionState::Reading);
    let line = match handler.read(conn).await {
        Ok(line) => line,
        Err(e) => {
            conn.set_state(ConnectionState::ReadingError);
            return Err(e);
        }
    };

    conn.set_state(ConnectionState::Parsing);
    let mut request = match handler.parse(conn, &line) {
        Ok(request) => request,
        Err(e) => {
            conn.set_state(ConnectionState::ParsingError);
            return Err(e);
        }
    };
    if request.route.is_empty() {
        request.route = "index".to_string();
    }
    tracing::debug!(connection = %conn.id, route = %request.route, "Request parsed");

    conn.set_state(ConnectionState::Processing);
    let outcome = match handler.process(conn, &request, false).await {
        Ok(outcome) => outcome,
        Err(e) => {
            conn.set_state(ConnectionState::ProcessingError);
            return Err(e);
        }
    };
    conn.code = outcome.code;
    let cache_status = outcome.cache_status;

    conn.set_state(ConnectionState::Writing);
    if let Err(e) = handler.write(conn, outcome.payload).await {
        conn.set_state(ConnectionState::WritingError);
        return Err(e);
    }
    conn.set_state(ConnectionState::Finished);

    tracing::info!(
        connection = %conn.id,
        remote = %conn.remote_addr,
        route = %request.route,
        code = conn.code,
        cache = %cache_status,
        duration_us = conn.elapsed().as_micros() as u64,
        "access"
    );
    Ok(())
}

/// Force a fresh render of `route` into the cache.
pub async fn serve_crontab<H>(handler: &H, conn: &mut Connection, route: &str) -> Result<Outcome, HandlerError>
where
    H: ProtocolHandler + ?Sized,
{
    conn.set_state(ConnectionState::Processing);
    let request = Request {
        route: route.to_string(),
        extra: None,
    };
    let outcome = match handler.process(conn, &request, true).await {
        Ok(outcome) => outcome,
        Err(e) => {
            conn.set_state(ConnectionState::ProcessingError);
            return Err(e);
        }
    };
    conn.code = outcome.code;
    conn.set_state(ConnectionState::Finished);

    tracing::info!(
        connection = %conn.id,
        route = %route,
        code = outcome.code,
        cache = %outcome.cache_status,
        "cron"
    );
    Ok(outcome)
}

/// First line of the request without its line terminator.
pub async fn read_request_line(conn: &mut Connection) -> Result<String, HandlerError> {
    let line = conn.read_line().await.map_err(HandlerError::Read)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Write the payload and flush. The CRLF is already part of the payload.
pub async fn write_payload(conn: &mut Connection, payload: Payload) -> Result<(), HandlerError> {
    match payload {
        Payload::Bytes(data) => conn.write_all(&data).await.map_err(HandlerError::Write)?,
        Payload::File(mut file) => {
            conn.copy_from(&mut file).await.map_err(HandlerError::Write)?;
        }
    }
    conn.flush().await.map_err(HandlerError::Write)
}
