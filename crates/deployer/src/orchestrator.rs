use std::{io, path::Path, time::Duration};

use common::config::Config;
use derive_more::{Display, Error, From};
use indicatif::{MultiProgress, ProgressBar};
use itertools::Itertools;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{info, warn};

use crate::{
    archiver::{self, ArchiverError},
    outputs::{sanitize_key, Outputs},
    poller::{self, PollOutcome, PollPolicy},
    preflight::{self, PreflightError},
    selector::{self, Filter, PackageCandidate, SelectError},
    transport::Transport,
    uploader::{self, UploadError, UploadRecord, UploadResult},
};

/// Orchestration errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum DeployError {
    /// Pre-flight check failed.
    Preflight(PreflightError),

    /// Package selection failed.
    Select(SelectError),

    /// Selection is empty, while at least one package is required.
    #[display(fmt = "no packages to deploy in {}", _0)]
    #[from(ignore)]
    NoMatch(#[error(ignore)] String),

    /// Zip archiver error.
    #[display(fmt = "unable to create zip archive: {}", _0)]
    Archiver(ArchiverError),

    /// Upload failed or was rejected.
    Upload(UploadError),

    /// Some packages never reported the `STARTED` status.
    #[display(fmt = "packages did not start in time: {}", "_0.join(\", \")")]
    #[from(ignore)]
    PollTimeout(#[error(ignore)] Vec<String>),

    /// IO-related error.
    Io(io::Error),
}

/// Output values of a single uploaded package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PackageOutput {
    /// Sanitized package name, used as an output key prefix.
    pub key: String,

    /// Matched upload response entry, or an empty one if the server omitted the package.
    pub record: UploadRecord,
}

/// Everything a deployment run produced.
#[derive(Debug, Default)]
pub(crate) struct RunReport {
    /// Selected packages.
    pub candidates: Vec<PackageCandidate>,

    /// Classified upload response.
    pub upload: Option<UploadResult>,

    /// Output values, one entry per selected package.
    pub packages: Vec<PackageOutput>,

    /// Status check outcomes, in the order packages were requested.
    pub evidence: Vec<PollOutcome>,
}

/// Run the whole deployment flow.
///
/// The flow consists of pre-flight checks, package selection, archiving, upload,
/// output emission and, for asynchronous uploads, package status checks.
pub(crate) async fn run(
    config: &Config,
    transport: &dyn Transport,
    outputs: &mut Outputs,
    progress: &MultiProgress,
) -> Result<RunReport, DeployError> {
    let pg = progress.add(ProgressBar::new_spinner());
    pg.enable_steady_tick(Duration::from_millis(150));

    let result = deploy(config, transport, outputs, progress, &pg).await;
    abandon_on_error(&pg, result)
}

/// Stop a spinner that is still running when the flow failed.
fn abandon_on_error<T>(
    pg: &ProgressBar,
    result: Result<T, DeployError>,
) -> Result<T, DeployError> {
    if result.is_err() && !pg.is_finished() {
        pg.abandon_with_message("Deployment failed.");
    }

    result
}

/// Deployment steps, reporting progress with the provided spinner.
async fn deploy(
    config: &Config,
    transport: &dyn Transport,
    outputs: &mut Outputs,
    progress: &MultiProgress,
    pg: &ProgressBar,
) -> Result<RunReport, DeployError> {
    pg.set_message("Running pre-flight checks...");
    preflight::check_package_dir(&config.package_dir)?;
    preflight::check_host(&config.base_url).await?;

    let filter = Filter::from_config(config)?;
    let candidates = selector::select(&config.package_dir, &filter)?;

    if candidates.is_empty() {
        let package_dir = config.package_dir.display().to_string();

        if config.fail_when_empty {
            pg.finish_and_clear();
            return Err(DeployError::NoMatch(package_dir));
        }

        warn!(%package_dir, "no packages matched, nothing to do");
        pg.finish_with_message("Nothing to deploy.");
        return Ok(RunReport::default());
    }

    info!(
        packages = %candidates.iter().map(|candidate| &candidate.name).join(", "),
        "selected packages"
    );

    pg.set_message("Archiving...");
    let artifact = archiver::archive(&candidates)?;

    pg.set_message("Uploading packages...");
    let upload = uploader::upload(transport, &artifact).await?;
    drop(artifact);

    let packages = emit_outputs(outputs, &candidates, &upload)?;

    if !upload.disposition.is_success(config.async_upload) {
        pg.finish_with_message("Upload was not confirmed.");
        return Err(UploadError::NotConfirmed.into());
    }

    info!(status = %upload.http_status, disposition = ?upload.disposition, "packages uploaded");

    let mut report = RunReport {
        candidates,
        upload: Some(upload),
        packages,
        evidence: Vec::new(),
    };

    if !config.async_upload {
        pg.finish_with_message("Packages uploaded.");
        return Ok(report);
    }

    pg.finish_with_message("Packages uploaded, checking status...");

    let names = match config.success_check_package_name() {
        Some(name) => vec![name.to_owned()],
        None => report
            .candidates
            .iter()
            .map(|candidate| candidate.name.clone())
            .collect(),
    };

    report.evidence = confirm(config, transport, &names, progress).await?;

    Ok(report)
}

/// Emit one output set per selected package.
///
/// Packages omitted by the server still get their outputs, with empty values.
/// A single package also gets un-prefixed outputs.
fn emit_outputs(
    outputs: &mut Outputs,
    candidates: &[PackageCandidate],
    upload: &UploadResult,
) -> Result<Vec<PackageOutput>, io::Error> {
    let packages: Vec<PackageOutput> = candidates
        .iter()
        .map(|candidate| {
            let record = upload.record(&candidate.name).cloned().unwrap_or_else(|| {
                warn!(package = %candidate.name, "package is missing from the upload response");
                UploadRecord::default()
            });

            PackageOutput {
                key: sanitize_key(&candidate.name),
                record,
            }
        })
        .collect();

    for package in &packages {
        set_record(outputs, &format!("{}_", package.key), &package.record)?;
    }

    if let [package] = packages.as_slice() {
        set_record(outputs, "", &package.record)?;
    }

    Ok(packages)
}

/// Set `id`, `name`, `status` and `version` outputs with the provided key prefix.
fn set_record(outputs: &mut Outputs, prefix: &str, record: &UploadRecord) -> io::Result<()> {
    outputs.set(&format!("{prefix}id"), &record.id)?;
    outputs.set(&format!("{prefix}name"), &record.name)?;
    outputs.set(&format!("{prefix}status"), &record.status)?;
    outputs.set(&format!("{prefix}version"), &record.version)?;
    Ok(())
}

/// Poll package statuses, then report and persist the evidence.
///
/// Timed out packages are only reported, unless `require_started` is set.
pub(crate) async fn confirm(
    config: &Config,
    transport: &dyn Transport,
    names: &[String],
    progress: &MultiProgress,
) -> Result<Vec<PollOutcome>, DeployError> {
    let evidence =
        poller::poll_all(transport, names, PollPolicy::from_config(config), progress).await;

    println!("Package status check results:");
    for outcome in &evidence {
        println!("{}", outcome.evidence());
    }

    if let Some(path) = &config.evidence_log {
        persist_evidence(path, &evidence).await?;
    }

    let timed_out: Vec<String> = evidence
        .iter()
        .filter(|outcome| !outcome.is_started())
        .map(|outcome| outcome.name.clone())
        .collect();

    if !timed_out.is_empty() {
        warn!(packages = %timed_out.join(", "), "some packages did not start in time");

        if config.require_started {
            return Err(DeployError::PollTimeout(timed_out));
        }
    }

    Ok(evidence)
}

/// Append evidence records to a log file, one complete line per write.
async fn persist_evidence(path: &Path, evidence: &[PollOutcome]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    for outcome in evidence {
        file.write_all(format!("{}\n", outcome.evidence()).as_bytes())
            .await?;
    }

    file.flush().await
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Cursor};

    use common::config::Config;
    use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget};
    use reqwest::StatusCode;
    use tempfile::TempDir;
    use zip::ZipArchive;

    use super::{abandon_on_error, deploy as deploy_steps, run, DeployError, RunReport};
    use crate::{
        outputs::Outputs,
        poller::PollState,
        preflight::PreflightError,
        testing::StubTransport,
        uploader::{Disposition, UploadError},
    };

    const UPLOADED: &str = r#"[
        {"name":"a","id":"1","status":"STARTED","version":"3"},
        {"name":"c","id":"2","status":"STARTED","version":"1"}
    ]"#;

    const RUNNING: &str = r#"{"status":"RUNNING"}"#;
    const STARTED: &str = r#"{"status":"STARTED"}"#;

    fn package_root(packages: &[&str]) -> TempDir {
        let root = tempfile::tempdir().unwrap();
        let package_dir = root.path().join("packages");

        fs::create_dir(&package_dir).unwrap();

        for package in packages {
            fs::create_dir(package_dir.join(package)).unwrap();
            fs::write(package_dir.join(package).join("package.xml"), *package).unwrap();
        }

        root
    }

    fn config(root: &TempDir) -> Config {
        let mut config = Config::for_tests();
        config.package_dir = root.path().join("packages");
        config.success_check_timeout = 3;
        config
    }

    async fn deploy(
        config: &Config,
        transport: &StubTransport,
    ) -> (Result<RunReport, DeployError>, Outputs) {
        let mut outputs = Outputs::new(None);
        let progress = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        let result = run(config, transport, &mut outputs, &progress).await;
        (result, outputs)
    }

    #[tokio::test]
    async fn selected_packages_are_uploaded() {
        let root = package_root(&["a", "b", "c"]);
        let mut config = config(&root);
        config.package_name_pattern = Some(String::from("^a|c$"));

        let transport = StubTransport::new().upload_response(StatusCode::OK, UPLOADED);

        let (result, outputs) = deploy(&config, &transport).await;
        let report = result.unwrap();

        let names: Vec<&str> = report
            .candidates
            .iter()
            .map(|candidate| candidate.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "c"]);

        let uploads = transport.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].file_name, "packages.zip");

        let archive = ZipArchive::new(Cursor::new(uploads[0].contents.clone())).unwrap();
        let mut entries: Vec<&str> = archive.file_names().collect();
        entries.sort();
        assert_eq!(entries, vec!["a/", "a/package.xml", "c/", "c/package.xml"]);

        assert_eq!(report.packages.len(), 2);
        assert_eq!(outputs.get("a_id"), Some("1"));
        assert_eq!(outputs.get("a_version"), Some("3"));
        assert_eq!(outputs.get("c_id"), Some("2"));
        assert_eq!(outputs.get("c_status"), Some("STARTED"));
        assert_eq!(outputs.get("id"), None);
        assert_eq!(outputs.values().len(), 8);

        assert!(report.evidence.is_empty());
        assert!(transport.status_calls().is_empty());
    }

    #[tokio::test]
    async fn omitted_packages_get_empty_outputs() {
        let root = package_root(&["a", "b-2", "c"]);
        let config = config(&root);

        let transport = StubTransport::new().upload_response(StatusCode::OK, UPLOADED);

        let (result, outputs) = deploy(&config, &transport).await;
        let report = result.unwrap();

        assert_eq!(report.packages.len(), 3);
        assert_eq!(report.packages[1].key, "b_2");
        assert_eq!(outputs.get("b_2_id"), Some(""));
        assert_eq!(outputs.get("b_2_name"), Some(""));
        assert_eq!(outputs.get("b_2_status"), Some(""));
        assert_eq!(outputs.get("b_2_version"), Some(""));
        assert_eq!(outputs.values().len(), 12);
    }

    #[tokio::test]
    async fn single_package_gets_plain_outputs() {
        let root = package_root(&["a"]);
        let config = config(&root);

        let transport = StubTransport::new().upload_response(StatusCode::OK, UPLOADED);

        let (result, outputs) = deploy(&config, &transport).await;
        result.unwrap();

        assert_eq!(transport.uploads()[0].file_name, "a.zip");
        assert_eq!(outputs.get("a_id"), Some("1"));
        assert_eq!(outputs.get("id"), Some("1"));
        assert_eq!(outputs.get("name"), Some("a"));
        assert_eq!(outputs.get("status"), Some("STARTED"));
        assert_eq!(outputs.get("version"), Some("3"));
    }

    #[tokio::test]
    async fn missing_package_dir_stops_before_upload() {
        let root = package_root(&[]);
        let mut config = config(&root);
        config.package_dir = root.path().join("missing");

        let transport = StubTransport::new().upload_response(StatusCode::OK, UPLOADED);

        let (result, _) = deploy(&config, &transport).await;

        assert!(matches!(
            result,
            Err(DeployError::Preflight(PreflightError::PackageDirNotFound(_)))
        ));
        assert!(transport.uploads().is_empty());
    }

    #[tokio::test]
    async fn invalid_base_url_stops_before_upload() {
        let root = package_root(&["a"]);
        let mut config = config(&root);
        config.base_url = String::from("esb.example.com");

        let transport = StubTransport::new().upload_response(StatusCode::OK, UPLOADED);

        let (result, _) = deploy(&config, &transport).await;

        assert!(matches!(
            result,
            Err(DeployError::Preflight(PreflightError::InvalidBaseUrl(_)))
        ));
        assert!(transport.uploads().is_empty());
    }

    #[tokio::test]
    async fn empty_selection() {
        let root = package_root(&["a", "b"]);
        let mut config = config(&root);
        config.allowed_packages = vec![String::from("z")];

        let transport = StubTransport::new().upload_response(StatusCode::OK, UPLOADED);

        let (result, outputs) = deploy(&config, &transport).await;
        let report = result.unwrap();

        assert!(report.candidates.is_empty());
        assert!(report.upload.is_none());
        assert!(outputs.values().is_empty());
        assert!(transport.uploads().is_empty());

        config.fail_when_empty = true;

        let (result, _) = deploy(&config, &transport).await;

        assert!(matches!(result, Err(DeployError::NoMatch(_))));
        assert!(transport.uploads().is_empty());
    }

    #[tokio::test]
    async fn rejected_upload_skips_status_checks() {
        let root = package_root(&["a"]);
        let mut config = config(&root);
        config.async_upload = true;

        let transport = StubTransport::new()
            .upload_response(StatusCode::INTERNAL_SERVER_ERROR, UPLOADED)
            .status_responses("a", [(StatusCode::OK, STARTED)]);

        let (result, outputs) = deploy(&config, &transport).await;

        assert!(matches!(
            result,
            Err(DeployError::Upload(UploadError::Rejected { .. }))
        ));
        assert!(outputs.values().is_empty());
        assert!(transport.status_calls().is_empty());
    }

    #[tokio::test]
    async fn gateway_timeout_requires_async_upload() {
        let root = package_root(&["a"]);
        let config = config(&root);

        let transport =
            StubTransport::new().upload_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout");

        let (result, outputs) = deploy(&config, &transport).await;

        assert!(matches!(
            result,
            Err(DeployError::Upload(UploadError::NotConfirmed))
        ));

        // Outputs are still emitted for every package.
        assert_eq!(outputs.get("a_id"), Some(""));
        assert!(transport.status_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn async_upload_checks_every_package() {
        let root = package_root(&["a", "c"]);
        let mut config = config(&root);
        config.async_upload = true;

        let transport = StubTransport::new()
            .upload_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
            .status_responses("a", [(StatusCode::OK, RUNNING), (StatusCode::OK, STARTED)])
            .status_responses("c", [(StatusCode::OK, RUNNING)]);

        let (result, _) = deploy(&config, &transport).await;
        let report = result.unwrap();

        assert_eq!(
            report.upload.as_ref().map(|upload| upload.disposition),
            Some(Disposition::Accepted)
        );
        assert_eq!(report.evidence.len(), 2);
        assert_eq!(report.evidence[0].name, "a");
        assert_eq!(report.evidence[0].state, PollState::Started);
        assert_eq!(report.evidence[1].name, "c");
        assert_eq!(report.evidence[1].state, PollState::TimedOut);
        assert_eq!(transport.status_call_count("a"), 2);
        assert_eq!(transport.status_call_count("c"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn single_package_check_override() {
        let root = package_root(&["a", "c"]);
        let mut config = config(&root);
        config.async_upload = true;
        config.success_check_package_name = Some(String::from("c"));

        let transport = StubTransport::new()
            .upload_response(StatusCode::OK, UPLOADED)
            .status_responses("c", [(StatusCode::OK, STARTED)]);

        let (result, _) = deploy(&config, &transport).await;
        let report = result.unwrap();

        assert_eq!(report.evidence.len(), 1);
        assert_eq!(report.evidence[0].name, "c");
        assert_eq!(transport.status_call_count("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn required_confirmation() {
        let root = package_root(&["a", "c"]);
        let mut config = config(&root);
        config.async_upload = true;
        config.require_started = true;
        config.evidence_log = Some(root.path().join("evidence.log"));

        let transport = StubTransport::new()
            .upload_response(StatusCode::OK, UPLOADED)
            .status_responses("a", [(StatusCode::OK, STARTED)])
            .status_responses("c", [(StatusCode::OK, RUNNING)]);

        let (result, _) = deploy(&config, &transport).await;

        match result {
            Err(DeployError::PollTimeout(packages)) => assert_eq!(packages, vec!["c"]),
            other => panic!("unexpected deployment result: {other:?}"),
        }

        let evidence = fs::read_to_string(root.path().join("evidence.log")).unwrap();
        let lines: Vec<&str> = evidence.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"a: {"status":"STARTED"}"#);
        assert_eq!(
            lines[1],
            "c: timed out after 3 attempts, last status: RUNNING"
        );
    }

    #[tokio::test]
    async fn failed_steps_stop_the_spinner() {
        let root = package_root(&[]);
        let mut config = config(&root);
        config.package_dir = root.path().join("missing");

        let transport = StubTransport::new();
        let mut outputs = Outputs::new(None);
        let progress = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        let pg = ProgressBar::hidden();

        let result = deploy_steps(&config, &transport, &mut outputs, &progress, &pg).await;

        assert!(!pg.is_finished());
        assert!(abandon_on_error(&pg, result).is_err());
        assert!(pg.is_finished());
        assert_eq!(pg.message(), "Deployment failed.");
    }

    #[tokio::test]
    async fn finished_spinner_keeps_its_message() {
        let root = package_root(&["a"]);
        let config = config(&root);

        let transport =
            StubTransport::new().upload_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout");
        let mut outputs = Outputs::new(None);
        let progress = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        let pg = ProgressBar::hidden();

        let result = deploy_steps(&config, &transport, &mut outputs, &progress, &pg).await;

        assert!(abandon_on_error(&pg, result).is_err());
        assert_eq!(pg.message(), "Upload was not confirmed.");
    }
}
