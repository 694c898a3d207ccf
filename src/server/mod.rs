mod config;
pub mod templates;

use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::{Html, IntoResponse, Redirect, Response as AxumResponse};
use axum::{
    Router,
    extract::{Form, Multipart, Path, Query, State},
    http::{StatusCode, header},
    routing::{get, post},
};
use chrono::{Local, NaiveDate, NaiveTime};
pub use config::{AppConfig, ConfigError};
use minijinja::context;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info_span;
use uuid::Uuid;

use crate::export::Exporter;
use crate::storage::models::Report;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: crate::storage::Store,
    exporter: Exporter,
    templates: Arc<minijinja::Environment<'static>>,
}

impl AppState {
    pub fn new(config: AppConfig, store: crate::storage::Store) -> Self {
        let exporter = Exporter::new(
            config.upload_dir.clone(),
            config.report_dir.clone(),
            config.technician.clone(),
        );
        Self {
            config,
            store,
            exporter,
            templates: templates::build_environment(),
        }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<Html<String>, AppError> {
        let template = self.templates.get_template(name).map_err(AppError::internal)?;
        let body = template.render(ctx).map_err(AppError::internal)?;
        Ok(Html(body))
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
        )
    });

    Router::new()
        .route("/", get(home))
        .route("/healthz", get(health))
        .route("/machine/{name}", get(machine_detail))
        .route("/new-machine", get(new_machine_form).post(new_machine_submit))
        .route("/new-report", get(new_report_form).post(new_report_submit))
        .route("/delete-machine/{name}", post(delete_machine))
        .route("/export/full", get(export_full))
        .route("/export/custom", post(export_custom))
        .route("/uploads/{file}", get(serve_upload))
        .with_state(state)
        .layer(trace)
        .layer(middleware::from_fn(add_request_id))
}

async fn health() -> &'static str {
    "ok"
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(ReqId(rid.clone()));
    let mut resp = next.run(req).await;
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

/// One-line status message carried across a redirect as a query parameter.
#[derive(Debug, Deserialize)]
struct FlashParams {
    msg: Option<String>,
}

fn redirect_with(path: &str, msg: &str) -> Redirect {
    let encoded = utf8_percent_encode(msg, NON_ALPHANUMERIC);
    let sep = if path.contains('?') { '&' } else { '?' };
    Redirect::to(&format!("{path}{sep}msg={encoded}"))
}

fn machine_path(name: &str) -> String {
    format!("/machine/{}", utf8_percent_encode(name, NON_ALPHANUMERIC))
}

/// Per-report display shape for the HTML views. Midnight means "no time
/// recorded" and renders without a time at all.
#[derive(Debug, Serialize)]
struct ReportView {
    date: String,
    time: Option<String>,
    description: String,
    image: Option<String>,
}

impl From<Report> for ReportView {
    fn from(r: Report) -> Self {
        Self {
            date: r.report_date.format("%d/%m/%Y").to_string(),
            time: (r.report_time != NaiveTime::MIN)
                .then(|| r.report_time.format("%H:%M").to_string()),
            description: r.description,
            image: r.image,
        }
    }
}

async fn home(
    State(state): State<AppState>,
    Query(flash): Query<FlashParams>,
) -> Result<Html<String>, AppError> {
    // Best-effort listing: a store failure degrades to an empty machine list
    // instead of an error page.
    let machines = match state.store.list_machines().await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error=%e, "machine listing unavailable; showing empty list");
            Vec::new()
        }
    };
    state.render(
        "index.html",
        context! { machines => machines, msg => flash.msg },
    )
}

async fn machine_detail(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(flash): Query<FlashParams>,
) -> Result<Html<String>, AppError> {
    let reports: Vec<ReportView> = state
        .store
        .list_reports_for_machine(&name)
        .await
        .map_err(AppError::internal)?
        .into_iter()
        .map(ReportView::from)
        .collect();
    state.render(
        "machine.html",
        context! { machine_name => name, reports => reports, msg => flash.msg },
    )
}

async fn new_machine_form(
    State(state): State<AppState>,
    Query(flash): Query<FlashParams>,
) -> Result<Html<String>, AppError> {
    state.render("new_machine.html", context! { msg => flash.msg })
}

#[derive(Debug, Deserialize)]
struct NewMachineForm {
    name: String,
}

async fn new_machine_submit(
    State(state): State<AppState>,
    Form(form): Form<NewMachineForm>,
) -> Result<Redirect, AppError> {
    let name = form.name.trim();
    if name.is_empty() {
        return Ok(redirect_with("/new-machine", "Please enter a machine name"));
    }
    let added = state
        .store
        .add_machine(name)
        .await
        .map_err(AppError::internal)?;
    if added {
        Ok(redirect_with("/", "Machine added"))
    } else {
        Ok(redirect_with(
            "/new-machine",
            "A machine with that name already exists",
        ))
    }
}

async fn new_report_form(
    State(state): State<AppState>,
    Query(flash): Query<FlashParams>,
) -> Result<Html<String>, AppError> {
    let machines = state
        .store
        .list_machines()
        .await
        .map_err(AppError::internal)?;
    state.render(
        "new_report.html",
        context! {
            machines => machines,
            today => Local::now().format("%Y-%m-%d").to_string(),
            msg => flash.msg,
        },
    )
}

async fn new_report_submit(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Redirect, AppError> {
    let mut machine_name = String::new();
    let mut date_raw = String::new();
    let mut time_raw = String::new();
    let mut description = String::new();
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "machine_name" => machine_name = read_text_field(field).await?,
            "date" => date_raw = read_text_field(field).await?,
            "time" => time_raw = read_text_field(field).await?,
            "description" => description = read_text_field(field).await?,
            "image" => {
                let original = field.file_name().unwrap_or("").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("could not read upload: {e}")))?;
                if !original.is_empty() && !bytes.is_empty() {
                    upload = Some((original, bytes.to_vec()));
                }
            }
            _ => {}
        }
    }

    if machine_name.trim().is_empty() || date_raw.trim().is_empty() || description.trim().is_empty()
    {
        return Ok(redirect_with(
            "/new-report",
            "Please complete all required fields",
        ));
    }
    let Ok(date) = NaiveDate::parse_from_str(date_raw.trim(), "%Y-%m-%d") else {
        return Ok(redirect_with("/new-report", "Please enter a valid date"));
    };
    let time = parse_time(&time_raw);

    let stored_image = match upload {
        Some((original, bytes)) => Some(store_upload(&state, &machine_name, &original, &bytes).await?),
        None => None,
    };

    let id = state
        .store
        .add_report(
            machine_name.trim(),
            date,
            time,
            description.trim(),
            stored_image.as_deref(),
        )
        .await
        .map_err(AppError::internal)?;
    tracing::debug!(id, machine=%machine_name, "report created");

    Ok(redirect_with(&machine_path(machine_name.trim()), "Report added"))
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid form field: {e}")))
}

/// Persist an uploaded photo as `{timestamp}_{machine}.{ext}` under the
/// upload dir. The machine part is filtered to filesystem-safe characters;
/// the extension comes from the original filename.
async fn store_upload(
    state: &AppState,
    machine: &str,
    original: &str,
    bytes: &[u8],
) -> Result<String, AppError> {
    let ext = original
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string());
    let safe_machine: String = machine
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let filename = format!(
        "{}_{}.{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        safe_machine,
        ext
    );
    let path = state.config.upload_dir.join(&filename);
    tokio::fs::create_dir_all(&state.config.upload_dir)
        .await
        .map_err(AppError::internal)?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(AppError::internal)?;
    Ok(filename)
}

/// Absent or unparseable time input means "no time recorded" (midnight).
fn parse_time(raw: &str) -> NaiveTime {
    let raw = raw.trim();
    if raw.is_empty() {
        return NaiveTime::MIN;
    }
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .unwrap_or(NaiveTime::MIN)
}

async fn delete_machine(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Redirect, AppError> {
    state
        .store
        .delete_machine(&name)
        .await
        .map_err(AppError::internal)?;
    Ok(redirect_with("/", "Machine deleted"))
}

async fn export_full(State(state): State<AppState>) -> Result<AxumResponse, AppError> {
    let reports = state
        .store
        .list_all_reports()
        .await
        .map_err(AppError::internal)?;
    let exporter = state.exporter.clone();
    let path = tokio::task::spawn_blocking(move || exporter.export_full(&reports))
        .await
        .map_err(AppError::internal)?
        .map_err(AppError::internal)?;
    pdf_attachment(&path).await
}

#[derive(Debug, Deserialize)]
struct CustomExportForm {
    title: String,
    start_date: String,
    end_date: String,
}

async fn export_custom(
    State(state): State<AppState>,
    Form(form): Form<CustomExportForm>,
) -> Result<AxumResponse, AppError> {
    let title = form.title.trim().to_string();
    let start = NaiveDate::parse_from_str(form.start_date.trim(), "%Y-%m-%d");
    let end = NaiveDate::parse_from_str(form.end_date.trim(), "%Y-%m-%d");
    let (Ok(start), Ok(end)) = (start, end) else {
        return Ok(redirect_with("/", "Please provide a valid date range").into_response());
    };
    if title.is_empty() {
        return Ok(redirect_with("/", "Please provide an export title").into_response());
    }

    let reports = state
        .store
        .list_reports_between(start, end)
        .await
        .map_err(AppError::internal)?;
    let exporter = state.exporter.clone();
    let path =
        tokio::task::spawn_blocking(move || exporter.export_range(&title, start, end, &reports))
            .await
            .map_err(AppError::internal)?
            .map_err(AppError::internal)?;
    pdf_attachment(&path).await
}

async fn pdf_attachment(path: &std::path::Path) -> Result<AxumResponse, AppError> {
    let bytes = tokio::fs::read(path).await.map_err(AppError::internal)?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("report.pdf")
        .to_string();
    let mut resp = axum::response::Response::new(axum::body::Body::from(bytes));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/pdf"),
    );
    let disposition = format!("attachment; filename=\"{filename}\"");
    resp.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).map_err(AppError::internal)?,
    );
    Ok(resp)
}

async fn serve_upload(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<AxumResponse, AppError> {
    // Stored names never contain separators; anything else is not ours.
    if file.contains('/') || file.contains('\\') || file.contains("..") {
        return Err(AppError::NotFound("no such image".to_string()));
    }
    let path = state.config.upload_dir.join(&file);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| AppError::NotFound("no such image".to_string()))?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut resp = axum::response::Response::new(axum::body::Body::from(bytes));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.as_ref())
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    Ok(resp)
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl AppError {
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> AxumResponse {
        let (status, msg, detail) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, None),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m, None),
            // Do not leak internal error details to clients, but log them
            AppError::Internal(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
                Some(m),
            ),
        };
        if let Some(detail) = detail {
            tracing::error!(status = %status, message = %msg, detail = %detail, "request failed");
        } else {
            tracing::error!(status = %status, message = %msg, "request failed");
        }
        (status, msg).into_response()
    }
}
