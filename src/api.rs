//! Read-only HTTP surface over the query engine. Handlers are thin: every
//! endpoint maps to one `QueryEngine` call wrapped in the versioned JSON
//! envelope.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::TryStreamExt;
use log::error;
use serde_json::{json, Map, Value};
use warp::http::header::{HeaderValue, CONTENT_TYPE};
use warp::http::StatusCode;
use warp::hyper::Body;
use warp::multipart::{FormData, Part};
use warp::{Buf, Filter};

use crate::query::{parse_buildinfo, BuildinfoOutcome, QueryEngine};

const API_VERSION: &str = "0.3";
const API_COMMENT: &str = "snapshot-mirror index";
const MAX_BUILDINFO_LENGTH: u64 = 4 * 1024 * 1024;

fn envelope() -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert("_api".to_string(), json!(API_VERSION));
    doc.insert("_comment".to_string(), json!(API_COMMENT));

    doc
}

fn json_reply(status: StatusCode, doc: Map<String, Value>) -> warp::reply::Response {
    let mut body = serde_json::to_string_pretty(&Value::Object(doc))
        .unwrap_or_else(|_| "{}".to_string());
    body.push('\n');
    let mut resp = warp::reply::Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    resp
}

/// 200 with `result` when non-empty, 404 otherwise, 500 on engine errors.
fn result_reply<T: serde::Serialize>(
    outcome: crate::errors::Result<Vec<T>>,
    extra: Map<String, Value>,
    to_value: impl Fn(Vec<T>) -> Value,
) -> warp::reply::Response {
    let mut doc = envelope();
    for (key, value) in extra {
        doc.insert(key, value);
    }
    match outcome {
        Ok(rows) if rows.is_empty() => json_reply(StatusCode::NOT_FOUND, doc),
        Ok(rows) => {
            doc.insert("result".to_string(), to_value(rows));
            json_reply(StatusCode::OK, doc)
        }
        Err(e) => {
            error!("{}", e);
            json_reply(StatusCode::INTERNAL_SERVER_ERROR, doc)
        }
    }
}

async fn timestamps(
    engine: Arc<QueryEngine>,
    archive: String,
) -> Result<warp::reply::Response, warp::Rejection> {
    Ok(result_reply(
        engine.archive_timestamps(&archive).await,
        Map::new(),
        |rows| json!(rows),
    ))
}

async fn files(engine: Arc<QueryEngine>) -> Result<warp::reply::Response, warp::Rejection> {
    Ok(result_reply(engine.file_names().await, Map::new(), |rows| {
        json!(rows
            .into_iter()
            .map(|name| json!({ "file": name }))
            .collect::<Vec<_>>())
    }))
}

async fn file_info(
    engine: Arc<QueryEngine>,
    sha256: String,
) -> Result<warp::reply::Response, warp::Rejection> {
    Ok(result_reply(
        engine.file_info(&sha256).await,
        Map::new(),
        |rows| json!(rows),
    ))
}

async fn packages(engine: Arc<QueryEngine>) -> Result<warp::reply::Response, warp::Rejection> {
    Ok(result_reply(
        engine.source_package_names().await,
        Map::new(),
        |rows| {
            json!(rows
                .into_iter()
                .map(|name| json!({ "package": name }))
                .collect::<Vec<_>>())
        },
    ))
}

async fn package_versions(
    engine: Arc<QueryEngine>,
    name: String,
) -> Result<warp::reply::Response, warp::Rejection> {
    let mut extra = Map::new();
    extra.insert("package".to_string(), json!(name));
    Ok(result_reply(
        engine.source_package_versions(&name).await,
        extra,
        |rows| {
            json!(rows
                .into_iter()
                .map(|version| json!({ "version": version }))
                .collect::<Vec<_>>())
        },
    ))
}

async fn srcfiles(
    engine: Arc<QueryEngine>,
    name: String,
    version: String,
    query: HashMap<String, String>,
) -> Result<warp::reply::Response, warp::Rejection> {
    let mut doc = envelope();
    doc.insert("package".to_string(), json!(name));
    doc.insert("version".to_string(), json!(version));
    let hashes = match engine.source_files(&name, &version).await {
        Ok(hashes) if hashes.is_empty() => return Ok(json_reply(StatusCode::NOT_FOUND, doc)),
        Ok(hashes) => hashes,
        Err(e) => {
            error!("{}", e);
            return Ok(json_reply(StatusCode::INTERNAL_SERVER_ERROR, doc));
        }
    };
    doc.insert(
        "result".to_string(),
        json!(hashes
            .iter()
            .map(|hash| json!({ "hash": hash }))
            .collect::<Vec<_>>()),
    );
    if query.get("fileinfo").map(String::as_str) == Some("1") {
        match engine.file_infos(&hashes).await {
            Ok(info) => {
                doc.insert("fileinfo".to_string(), json!(info));
            }
            Err(e) => {
                error!("{}", e);
                return Ok(json_reply(StatusCode::INTERNAL_SERVER_ERROR, doc));
            }
        }
    }

    Ok(json_reply(StatusCode::OK, doc))
}

async fn binary_versions(
    engine: Arc<QueryEngine>,
    name: String,
) -> Result<warp::reply::Response, warp::Rejection> {
    let mut extra = Map::new();
    extra.insert("binary".to_string(), json!(name));
    let binary = name.clone();
    Ok(result_reply(
        engine.binary_versions(&name).await,
        extra,
        move |rows| {
            json!(rows
                .into_iter()
                .map(|version| json!({ "name": binary.as_str(), "binary_version": version }))
                .collect::<Vec<_>>())
        },
    ))
}

async fn binfiles(
    engine: Arc<QueryEngine>,
    name: String,
    version: String,
    query: HashMap<String, String>,
) -> Result<warp::reply::Response, warp::Rejection> {
    let mut doc = envelope();
    doc.insert("binary".to_string(), json!(name));
    doc.insert("binary_version".to_string(), json!(version));
    let rows = match engine.binary_files(&name, &version).await {
        Ok(rows) if rows.is_empty() => return Ok(json_reply(StatusCode::NOT_FOUND, doc)),
        Ok(rows) => rows,
        Err(e) => {
            error!("{}", e);
            return Ok(json_reply(StatusCode::INTERNAL_SERVER_ERROR, doc));
        }
    };
    doc.insert(
        "result".to_string(),
        json!(rows
            .iter()
            .map(|row| json!({ "hash": row.sha256, "architecture": row.architecture }))
            .collect::<Vec<_>>()),
    );
    if query.get("fileinfo").map(String::as_str) == Some("1") {
        let hashes: Vec<String> = rows.iter().map(|row| row.sha256.clone()).collect();
        match engine.file_infos(&hashes).await {
            Ok(info) => {
                doc.insert("fileinfo".to_string(), json!(info));
            }
            Err(e) => {
                error!("{}", e);
                return Ok(json_reply(StatusCode::INTERNAL_SERVER_ERROR, doc));
            }
        }
    }

    Ok(json_reply(StatusCode::OK, doc))
}

async fn read_part(part: Part) -> Vec<u8> {
    let mut data = Vec::new();
    let mut stream = part.stream();
    while let Ok(Some(mut buf)) = stream.try_next().await {
        while buf.has_remaining() {
            let chunk = buf.chunk();
            data.extend_from_slice(chunk);
            let advance = chunk.len();
            buf.advance(advance);
        }
    }

    data
}

async fn buildinfo_common(
    engine: Arc<QueryEngine>,
    query: HashMap<String, String>,
    manifest: String,
) -> warp::reply::Response {
    let mut doc = envelope();
    let (deps, build_arch) = match parse_buildinfo(&manifest) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("{}", e);
            return json_reply(StatusCode::INTERNAL_SERVER_ERROR, doc);
        }
    };
    let suite_filter = query.get("suite_name").map(String::as_str);
    match engine.buildinfo(&deps, &build_arch, suite_filter).await {
        Ok(BuildinfoOutcome::NotFound(missing)) => {
            doc.insert("results".to_string(), json!(missing));
            json_reply(StatusCode::NOT_FOUND, doc)
        }
        Ok(BuildinfoOutcome::Covers(covers)) => {
            doc.insert("results".to_string(), json!(covers));
            json_reply(StatusCode::OK, doc)
        }
        Err(e) => {
            error!("{}", e);
            json_reply(StatusCode::INTERNAL_SERVER_ERROR, doc)
        }
    }
}

async fn buildinfo_multipart(
    engine: Arc<QueryEngine>,
    query: HashMap<String, String>,
    mut form: FormData,
) -> Result<warp::reply::Response, warp::Rejection> {
    let mut manifest = None;
    while let Ok(Some(part)) = form.try_next().await {
        if part.name() == "buildinfo" {
            manifest = Some(String::from_utf8_lossy(&read_part(part).await).into_owned());
        }
    }
    match manifest {
        Some(manifest) => Ok(buildinfo_common(engine, query, manifest).await),
        None => {
            error!("buildinfo form field missing");
            Ok(json_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                envelope(),
            ))
        }
    }
}

async fn buildinfo_raw(
    engine: Arc<QueryEngine>,
    query: HashMap<String, String>,
    body: warp::hyper::body::Bytes,
) -> Result<warp::reply::Response, warp::Rejection> {
    let manifest = String::from_utf8_lossy(&body).into_owned();
    Ok(buildinfo_common(engine, query, manifest).await)
}

pub async fn serve(engine: QueryEngine, addr: SocketAddr) -> Result<()> {
    let engine = Arc::new(engine);
    let engine = warp::any().map(move || engine.clone());

    let timestamps = warp::get()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("timestamp"))
        .and(warp::path::param())
        .and(warp::path::end())
        .and_then(timestamps);
    let files = warp::get()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("file"))
        .and(warp::path::end())
        .and_then(files);
    let file_info = warp::get()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("file"))
        .and(warp::path::param())
        .and(warp::path("info"))
        .and(warp::path::end())
        .and_then(file_info);
    let packages = warp::get()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("package"))
        .and(warp::path::end())
        .and_then(packages);
    let package_versions = warp::get()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("package"))
        .and(warp::path::param())
        .and(warp::path::end())
        .and_then(package_versions);
    let srcfiles = warp::get()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("package"))
        .and(warp::path::param())
        .and(warp::path::param())
        .and(warp::path("srcfiles"))
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and_then(srcfiles);
    let binary_versions = warp::get()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("binary"))
        .and(warp::path::param())
        .and(warp::path::end())
        .and_then(binary_versions);
    let binfiles = warp::get()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("binary"))
        .and(warp::path::param())
        .and(warp::path::param())
        .and(warp::path("binfiles"))
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and_then(binfiles);
    let buildinfo_form = warp::post()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("buildinfo"))
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::multipart::form().max_length(MAX_BUILDINFO_LENGTH))
        .and_then(buildinfo_multipart);
    let buildinfo_body = warp::post()
        .and(engine.clone())
        .and(warp::path("mr"))
        .and(warp::path("buildinfo"))
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::body::content_length_limit(MAX_BUILDINFO_LENGTH))
        .and(warp::body::bytes())
        .and_then(buildinfo_raw);

    let routes = timestamps
        .or(files)
        .or(file_info)
        .or(packages)
        .or(srcfiles)
        .or(package_versions)
        .or(binfiles)
        .or(binary_versions)
        .or(buildinfo_form)
        .or(buildinfo_body);

    warp::serve(routes).run(addr).await;

    Ok(())
}
