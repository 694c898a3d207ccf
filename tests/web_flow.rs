use machinelog::{server, storage};
use reqwest::{Client, StatusCode};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;

struct TestServer {
    base: String,
    client: Client,
    handle: tokio::task::JoinHandle<()>,
    _tempdir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Option<Self> {
        let dir = tempfile::tempdir().unwrap();
        let (addr, handle) = match start_server(dir.path()).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                eprintln!("Skipping test due to sandbox restrictions: {e}");
                return None;
            }
            Err(e) => panic!("failed to start server: {e}"),
        };
        Some(Self {
            base: format!("http://{}", addr),
            client: Client::new(),
            handle,
            _tempdir: dir,
        })
    }

    async fn get(&self, path: &str) -> (StatusCode, String) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        (resp.status(), resp.text().await.unwrap())
    }

    /// POST a urlencoded form; redirects are followed, so the returned body
    /// is the page the browser would land on.
    async fn post_form(&self, path: &str, fields: &[(&str, &str)]) -> (StatusCode, String) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .form(fields)
            .send()
            .await
            .unwrap();
        (resp.status(), resp.text().await.unwrap())
    }

    async fn post_report(
        &self,
        machine: &str,
        date: &str,
        time: &str,
        description: &str,
        image: Option<(&str, Vec<u8>)>,
    ) -> (StatusCode, String) {
        let mut form = reqwest::multipart::Form::new()
            .text("machine_name", machine.to_string())
            .text("date", date.to_string())
            .text("time", time.to_string())
            .text("description", description.to_string());
        if let Some((filename, bytes)) = image {
            let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
            form = form.part("image", part);
        }
        let resp = self
            .client
            .post(format!("{}/new-report", self.base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        (resp.status(), resp.text().await.unwrap())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server(
    tmp: &Path,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
    let config = server::AppConfig {
        db_path: tmp.join("test.db"),
        upload_dir: tmp.join("uploads"),
        report_dir: tmp.join("reports"),
        listen_port: None,
        technician: "Test Technician".to_string(),
    };
    config.ensure_dirs()?;

    let store = storage::Store::connect_sqlite(config.db_path.to_str().unwrap())
        .await
        .expect("db");

    let state = server::AppState::new(config, store);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Ok((addr, handle))
}

#[tokio::test]
async fn health_and_empty_home_page() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let (status, body) = server.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let (status, body) = server.get("/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("No machines yet"));
}

#[tokio::test]
async fn machine_lifecycle_with_reports_and_uploads() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };

    // Create a machine; the flash message survives the redirect.
    let (status, body) = server.post_form("/new-machine", &[("name", "Press A")]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Machine added"));
    assert!(body.contains("Press A"));

    // Duplicates are reported, not fatal.
    let (status, body) = server.post_form("/new-machine", &[("name", "Press A")]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("already exists"));

    // A report without a time renders without a time suffix.
    let (status, body) = server
        .post_report("Press A", "2024-01-02", "", "Bearing noise", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Report added"));
    assert!(body.contains("Bearing noise"));
    // The HTML auto-escaper also escapes slashes, so dates arrive as &#x2f;.
    assert!(body.contains("02&#x2f;01&#x2f;2024"));
    assert!(!body.contains("02&#x2f;01&#x2f;2024 —"));

    // An older report with a time and a photo.
    let (status, body) = server
        .post_report(
            "Press A",
            "2024-01-01",
            "14:30",
            "Oil change",
            Some(("photo.jpg", b"not really a jpeg".to_vec())),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("14:30"));

    // Newest first on the machine page.
    let (_, page) = server.get("/machine/Press%20A").await;
    let newer = page.find("Bearing noise").unwrap();
    let older = page.find("Oil change").unwrap();
    assert!(newer < older);

    // The stored photo is served back from /uploads/.
    let src_start = page.find("/uploads/").unwrap();
    let src = &page[src_start..page[src_start..].find('"').unwrap() + src_start];
    let resp = server
        .client
        .get(format!("{}{}", server.base, src))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"not really a jpeg");

    // Path probing is a 404.
    let (status, _) = server.get("/uploads/no_such_file.png").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Deleting the machine cascades; its page is empty afterwards.
    let (status, body) = server.post_form("/delete-machine/Press%20A", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Machine deleted"));
    let (_, page) = server.get("/machine/Press%20A").await;
    assert!(page.contains("No reports recorded"));
}

#[tokio::test]
async fn exports_return_pdf_attachments() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    server.post_form("/new-machine", &[("name", "Lathe")]).await;
    server
        .post_report(
            "Lathe",
            "2024-02-01",
            "09:15",
            "Chuck alignment checked",
            Some(("broken.png", b"not an image either".to_vec())),
        )
        .await;

    // Full history export; the undecodable photo is skipped, not fatal.
    let resp = server
        .client
        .get(format!("{}/export/full", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/pdf"
    );
    let disposition = resp
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("attachment"));
    assert!(disposition.contains("report_machines_"));
    assert!(resp.bytes().await.unwrap().starts_with(b"%PDF"));

    // Ranged export over an empty window still yields a valid document.
    let resp = server
        .client
        .post(format!("{}/export/custom", server.base))
        .form(&[
            ("title", "Quarterly review"),
            ("start_date", "2000-01-01"),
            ("end_date", "2000-01-31"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let disposition = resp
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("report_custom_"));
    assert!(resp.bytes().await.unwrap().starts_with(b"%PDF"));

    // A bad range redirects home with a validation message instead.
    let (status, body) = server
        .post_form(
            "/export/custom",
            &[
                ("title", "Broken"),
                ("start_date", "not-a-date"),
                ("end_date", "2024-01-31"),
            ],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("valid date range"));
}

#[tokio::test]
async fn validation_redirects_carry_messages() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let (status, body) = server.post_form("/new-machine", &[("name", "   ")]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Please enter a machine name"));

    server.post_form("/new-machine", &[("name", "Mill")]).await;
    let (status, body) = server.post_report("Mill", "2024-01-01", "", "", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Please complete all required fields"));

    let (status, body) = server
        .post_report("Mill", "01/01/2024", "", "wrong date format", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Please enter a valid date"));
}
