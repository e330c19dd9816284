use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use caravel_core::compress::gzip_compress;
use caravel_types::BucketCompression;

use crate::error::ServerError;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct ChunkQuery {
    offset: Option<String>,
    size: Option<String>,
    compression: Option<String>,
}

fn parse_size_argument(name: &str, value: Option<&str>) -> Result<u64, ServerError> {
    match value {
        None => Ok(0),
        Some(text) => text.parse::<u64>().map_err(|_| {
            ServerError::bad_request(format!(
                "the \"{name}\" GET argument must be a non-negative integer: {text}"
            ))
        }),
    }
}

/// GET `/transfers/chunks/{id1}.{id2}...?offset=&size=&compression=` —
/// stream one pull bucket.
///
/// The offset skips whole leading instances first; bytes are then
/// accumulated across the dotted instances until `size` bytes are
/// collected (`size=0` means everything).
pub async fn serve_chunks(
    State(state): State<AppState>,
    Path(ids): Path<String>,
    Query(query): Query<ChunkQuery>,
) -> Result<Response, ServerError> {
    let mut offset = parse_size_argument("offset", query.offset.as_deref())?;
    let requested_size = parse_size_argument("size", query.size.as_deref())?;
    let compression = match query.compression.as_deref() {
        None => BucketCompression::None,
        Some(value) => BucketCompression::parse(value)?,
    };

    // Limit the number of concurrently served chunk streams
    let _permit = state
        .inner
        .chunk_permits
        .acquire()
        .await
        .expect("the chunk semaphore is never closed");

    let context = state.inner.clone();
    let payload = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ServerError> {
        let mut buffer: Vec<u8> = Vec::new();

        for instance_id in ids.split('.') {
            if requested_size != 0 && buffer.len() as u64 >= requested_size {
                break;
            }

            let info = context.cache.instance_info(instance_id)?;

            if offset >= info.size() {
                // The requested range starts past this instance
                offset -= info.size();
                continue;
            }

            let to_read = if requested_size == 0 {
                info.size() - offset
            } else {
                (requested_size - buffer.len() as u64).min(info.size() - offset)
            };

            let (chunk, _md5) = context.cache.chunk(instance_id, offset, to_read)?;
            buffer.extend_from_slice(&chunk);
            offset = 0;
        }

        Ok(buffer)
    })
    .await
    .map_err(|e| ServerError::from(caravel_types::CaravelError::Internal(e.to_string())))??;

    let response = match compression {
        BucketCompression::None => (
            [(CONTENT_TYPE, "application/octet-stream")],
            Body::from(payload),
        )
            .into_response(),
        BucketCompression::Gzip => (
            [(CONTENT_TYPE, "application/gzip")],
            Body::from(gzip_compress(&payload).map_err(ServerError::from)?),
        )
            .into_response(),
    };

    Ok(response)
}
