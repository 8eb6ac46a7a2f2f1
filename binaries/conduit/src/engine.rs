//! The embedded script engine. Scripts arrive as message bodies and run in a
//! fresh rhai engine wired to a narrow set of host calls; values crossing the
//! boundary are strings, integers, booleans, and maps of strings, nothing
//! else. Host failures surface as script runtime errors, never panics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use conduit_client::Client;
use conduit_structs::{AgentRequest, AgentResponse, Signed};
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position, Scope};

/// Everything a running script may reach back into.
#[derive(Clone)]
pub struct HostContext {
    pub deployment_id: String,
    pub script_id: String,
    /// Downloaded asset for this message, when the deployment carries one.
    pub asset_path: Option<PathBuf>,
    /// Named peer workers reachable through the agent host call.
    pub agents: BTreeMap<String, String>,
    pub agent_access_key: String,
    pub responder: Responder,
    /// Handle into the worker's runtime; host calls run on a blocking
    /// thread and re-enter async I/O through it.
    pub runtime: tokio::runtime::Handle,
    pub http: reqwest::Client,
}

#[derive(Clone)]
pub enum Responder {
    /// Responses go back to the broker against the message being executed.
    Broker { client: Arc<Client>, message: String },
    /// Local execution (`execute`, agent fragments): responses just log.
    Local,
}

impl HostContext {
    /// A context with no broker attached, for local script execution.
    pub fn local(runtime: tokio::runtime::Handle) -> Self {
        Self {
            deployment_id: String::new(),
            script_id: String::new(),
            asset_path: None,
            agents: BTreeMap::new(),
            agent_access_key: String::new(),
            responder: Responder::Local,
            runtime,
            http: reqwest::Client::new(),
        }
    }
}

pub struct ScriptEngine {
    engine: Engine,
    scope: Scope<'static>,
    kill: Arc<AtomicBool>,
}

impl ScriptEngine {
    pub fn new(host: HostContext) -> Self {
        let mut engine = Engine::new();
        let kill = Arc::new(AtomicBool::new(false));
        {
            let kill = kill.clone();
            engine.on_progress(move |_| {
                if kill.load(Ordering::Relaxed) {
                    Some(Dynamic::from("terminated"))
                } else {
                    None
                }
            });
        }
        register_host_fns(&mut engine, &host);

        let mut scope = Scope::new();
        scope.push_constant("DEPLOYMENT_ID", host.deployment_id.clone());
        scope.push_constant("SCRIPT_ID", host.script_id.clone());
        Self {
            engine,
            scope,
            kill,
        }
    }

    /// Flag checked between script operations; setting it terminates the
    /// script at its next instruction.
    pub fn kill_switch(&self) -> Arc<AtomicBool> {
        self.kill.clone()
    }

    pub fn run(&mut self, script: &str) -> Result<(), String> {
        self.engine
            .run_with_scope(&mut self.scope, script)
            .map_err(|err| err.to_string())
    }

    /// A script opts into being kept alive by setting a top-level
    /// `persistent = true`; absence of the variable is not an error.
    pub fn wants_persistence(&self) -> bool {
        self.scope.get_value::<bool>("persistent").unwrap_or(false)
    }
}

fn register_host_fns(engine: &mut Engine, host: &HostContext) {
    engine.register_fn("log", |msg: ImmutableString| {
        tracing::info!(target: "script", "{msg}");
    });

    let ctx = host.clone();
    engine.register_fn("respond", move |text: ImmutableString| {
        send_response(&ctx, text.as_str(), false);
    });
    let ctx = host.clone();
    engine.register_fn("respond_error", move |text: ImmutableString| {
        send_response(&ctx, text.as_str(), true);
    });

    engine.register_fn(
        "system",
        |cmd: ImmutableString| -> Result<Map, Box<EvalAltResult>> {
            let output = Command::new("sh")
                .arg("-c")
                .arg(cmd.as_str())
                .output()
                .map_err(|err| runtime_err(format!("system: {err}")))?;
            let mut map = Map::new();
            map.insert(
                "stdout".into(),
                String::from_utf8_lossy(&output.stdout).into_owned().into(),
            );
            map.insert(
                "stderr".into(),
                String::from_utf8_lossy(&output.stderr).into_owned().into(),
            );
            map.insert(
                "status".into(),
                Dynamic::from(i64::from(output.status.code().unwrap_or(-1))),
            );
            Ok(map)
        },
    );

    engine.register_fn(
        "file_read",
        |path: ImmutableString| -> Result<String, Box<EvalAltResult>> {
            std::fs::read_to_string(path.as_str())
                .map_err(|err| runtime_err(format!("file_read {path}: {err}")))
        },
    );
    engine.register_fn(
        "file_write",
        |path: ImmutableString, content: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            std::fs::write(path.as_str(), content.as_bytes())
                .map_err(|err| runtime_err(format!("file_write {path}: {err}")))
        },
    );
    engine.register_fn("file_exists", |path: ImmutableString| {
        std::path::Path::new(path.as_str()).exists()
    });

    let ctx = host.clone();
    engine.register_fn(
        "download",
        move |url: ImmutableString, path: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            let bytes = ctx
                .runtime
                .block_on(async {
                    ctx.http
                        .get(url.as_str())
                        .send()
                        .await?
                        .error_for_status()?
                        .bytes()
                        .await
                })
                .map_err(|err| runtime_err(format!("download {url}: {err}")))?;
            std::fs::write(path.as_str(), &bytes)
                .map_err(|err| runtime_err(format!("download {path}: {err}")))
        },
    );

    let ctx = host.clone();
    engine.register_fn(
        "http_get",
        move |url: ImmutableString| -> Result<String, Box<EvalAltResult>> {
            ctx.runtime
                .block_on(async { ctx.http.get(url.as_str()).send().await?.text().await })
                .map_err(|err| runtime_err(format!("http_get {url}: {err}")))
        },
    );
    let ctx = host.clone();
    engine.register_fn(
        "http_post",
        move |url: ImmutableString,
              data: ImmutableString,
              content_type: ImmutableString|
              -> Result<String, Box<EvalAltResult>> {
            ctx.runtime
                .block_on(async {
                    ctx.http
                        .post(url.as_str())
                        .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
                        .body(data.to_string())
                        .send()
                        .await?
                        .text()
                        .await
                })
                .map_err(|err| runtime_err(format!("http_post {url}: {err}")))
        },
    );

    engine.register_fn(
        "zip_compress",
        |source: ImmutableString, target: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            zip_compress(Path::new(source.as_str()), Path::new(target.as_str()))
                .map_err(|err| runtime_err(format!("zip_compress {source}: {err}")))
        },
    );
    engine.register_fn(
        "zip_decompress",
        |source: ImmutableString, target: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            zip_decompress(Path::new(source.as_str()), Path::new(target.as_str()))
                .map_err(|err| runtime_err(format!("zip_decompress {source}: {err}")))
        },
    );
    engine.register_fn(
        "tar_compress",
        |source: ImmutableString, target: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            tar_compress(Path::new(source.as_str()), Path::new(target.as_str()))
                .map_err(|err| runtime_err(format!("tar_compress {source}: {err}")))
        },
    );
    engine.register_fn(
        "tar_decompress",
        |source: ImmutableString, target: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            tar_decompress(Path::new(source.as_str()), Path::new(target.as_str()))
                .map_err(|err| runtime_err(format!("tar_decompress {source}: {err}")))
        },
    );
    engine.register_fn(
        "gzip_compress",
        |source: ImmutableString, target: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            gzip_compress(Path::new(source.as_str()), Path::new(target.as_str()))
                .map_err(|err| runtime_err(format!("gzip_compress {source}: {err}")))
        },
    );
    engine.register_fn(
        "gzip_decompress",
        |source: ImmutableString, target: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            gzip_decompress(Path::new(source.as_str()), Path::new(target.as_str()))
                .map_err(|err| runtime_err(format!("gzip_decompress {source}: {err}")))
        },
    );

    let asset = host
        .asset_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    engine.register_fn("asset_path", move || asset.clone());

    let ctx = host.clone();
    engine.register_fn(
        "agent",
        move |name: ImmutableString, fragment: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            call_agent(&ctx, name.as_str(), fragment.as_str())
        },
    );
}

fn send_response(host: &HostContext, text: &str, is_error: bool) {
    match &host.responder {
        Responder::Broker { client, message } => {
            let result = host.runtime.block_on(client.respond(message, text, is_error));
            if let Err(err) = result {
                tracing::error!(error = %err, message = %message, "could not post response");
            }
        }
        Responder::Local => {
            if is_error {
                tracing::error!(target: "script", "{text}");
            } else {
                tracing::info!(target: "script", "{text}");
            }
        }
    }
}

fn call_agent(
    host: &HostContext,
    name: &str,
    fragment: &str,
) -> Result<(), Box<EvalAltResult>> {
    let addr = host
        .agents
        .get(name)
        .ok_or_else(|| runtime_err(format!("agent '{name}' not found")))?;
    let mut req = AgentRequest {
        function: fragment.to_string(),
        ..Default::default()
    };
    req.sign("", &host.agent_access_key);
    let url = format!("http://{addr}/");
    let response = host.runtime.block_on(async {
        let resp = host.http.post(&url).json(&req).send().await?;
        resp.json::<AgentResponse>().await
    });
    match response {
        Ok(body) if body.success => Ok(()),
        Ok(body) => Err(runtime_err(if body.error.is_empty() {
            format!("agent '{name}' failed")
        } else {
            body.error
        })),
        Err(err) => Err(runtime_err(format!("agent '{name}': {err}"))),
    }
}

/// Zip a file or directory tree into the archive at `target`. A directory
/// keeps its own name as the top-level entry, as workers expect when they
/// unpack beside the script.
fn zip_compress(source: &Path, target: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(target)?;
    let mut archive = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    if std::fs::metadata(source)?.is_dir() {
        let base = PathBuf::from(source_name(source)?);
        zip_add_dir(&mut archive, source, &base, &options)?;
    } else {
        archive.start_file(source_name(source)?, options)?;
        let mut reader = std::fs::File::open(source)?;
        std::io::copy(&mut reader, &mut archive)?;
    }
    archive.finish()?;
    Ok(())
}

fn zip_add_dir(
    archive: &mut zip::ZipWriter<std::fs::File>,
    dir: &Path,
    prefix: &Path,
    options: &zip::write::SimpleFileOptions,
) -> anyhow::Result<()> {
    archive.add_directory(prefix.to_string_lossy().into_owned(), options.clone())?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        if path.is_dir() {
            zip_add_dir(archive, &path, &name, options)?;
        } else {
            archive.start_file(name.to_string_lossy().into_owned(), options.clone())?;
            let mut reader = std::fs::File::open(&path)?;
            std::io::copy(&mut reader, archive)?;
        }
    }
    Ok(())
}

fn zip_decompress(source: &Path, target: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(source)?;
    let mut archive = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(target)?;
    archive.extract(target)?;
    Ok(())
}

/// Tar a file or directory tree into `<target>/<name>.tar`.
fn tar_compress(source: &Path, target: &Path) -> anyhow::Result<()> {
    let name = source_name(source)?;
    let file = std::fs::File::create(target.join(format!("{name}.tar")))?;
    let mut builder = tar::Builder::new(file);
    if std::fs::metadata(source)?.is_dir() {
        builder.append_dir_all(&name, source)?;
    } else {
        builder.append_path_with_name(source, &name)?;
    }
    builder.finish()?;
    Ok(())
}

fn tar_decompress(source: &Path, target: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(source)?;
    let mut archive = tar::Archive::new(file);
    std::fs::create_dir_all(target)?;
    archive.unpack(target)?;
    Ok(())
}

/// Gzip a single file into `<target>/<name>.gz`, recording the original
/// name in the gzip header so decompression can restore it.
fn gzip_compress(source: &Path, target: &Path) -> anyhow::Result<()> {
    let name = source_name(source)?;
    let mut reader = std::fs::File::open(source)?;
    let writer = std::fs::File::create(target.join(format!("{name}.gz")))?;
    let mut encoder = flate2::GzBuilder::new()
        .filename(name.as_bytes())
        .write(writer, flate2::Compression::default());
    std::io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

fn gzip_decompress(source: &Path, target: &Path) -> anyhow::Result<()> {
    let reader = std::fs::File::open(source)?;
    let mut decoder = flate2::read::GzDecoder::new(reader);
    std::fs::create_dir_all(target)?;

    // the gzip header is only parsed once decompression starts, so write
    // under the stripped source name first and rename afterwards if the
    // header carries a different one
    let fallback = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("cannot determine output name"))?;
    let out_path = target.join(&fallback);
    let mut writer = std::fs::File::create(&out_path)?;
    std::io::copy(&mut decoder, &mut writer)?;

    let header_name = decoder
        .header()
        .and_then(|header| header.filename())
        .map(|raw| String::from_utf8_lossy(raw).into_owned());
    if let Some(name) = header_name {
        // the header name is foreign input; never let it escape the target
        if name != fallback && !name.contains('/') && !name.contains('\\') && name != ".." {
            std::fs::rename(&out_path, target.join(&name))?;
        }
    }
    Ok(())
}

fn source_name(source: &Path) -> anyhow::Result<String> {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", source.display()))
}

fn runtime_err(msg: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(msg.into()),
        Position::NONE,
    ))
}

#[cfg(test)]
mod tests {
    use super::{HostContext, ScriptEngine};
    use std::sync::atomic::Ordering;

    fn local_host() -> HostContext {
        HostContext::local(tokio::runtime::Handle::current())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn constants_are_injected() {
        let mut host = local_host();
        host.deployment_id = "dep-1".to_string();
        host.script_id = "msg-1".to_string();
        let mut engine = ScriptEngine::new(host);
        tokio::task::spawn_blocking(move || {
            engine
                .run(r#"if DEPLOYMENT_ID != "dep-1" { throw "wrong deployment" }
                        if SCRIPT_ID != "msg-1" { throw "wrong script" }"#)
                .expect("script runs");
        })
        .await
        .expect("join");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persistence_flag_is_read_from_scope() {
        let mut engine = ScriptEngine::new(local_host());
        let engine = tokio::task::spawn_blocking(move || {
            engine.run("let persistent = true;").expect("script runs");
            engine
        })
        .await
        .expect("join");
        assert!(engine.wants_persistence());

        let mut plain = ScriptEngine::new(local_host());
        let plain = tokio::task::spawn_blocking(move || {
            plain.run("let x = 1;").expect("script runs");
            plain
        })
        .await
        .expect("join");
        assert!(!plain.wants_persistence());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_switch_terminates_execution() {
        let mut engine = ScriptEngine::new(local_host());
        let kill = engine.kill_switch();
        kill.store(true, Ordering::Relaxed);
        let err = tokio::task::spawn_blocking(move || engine.run("loop { }").unwrap_err())
            .await
            .expect("join");
        assert!(err.to_lowercase().contains("terminat"), "got: {err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn host_errors_become_script_errors() {
        let mut engine = ScriptEngine::new(local_host());
        let err = tokio::task::spawn_blocking(move || {
            engine.run(r#"file_read("/definitely/not/here")"#).unwrap_err()
        })
        .await
        .expect("join");
        assert!(err.contains("file_read"), "got: {err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn system_returns_a_typed_map() {
        let mut engine = ScriptEngine::new(local_host());
        tokio::task::spawn_blocking(move || {
            engine
                .run(r#"let out = system("printf hi");
                        if out.stdout != "hi" { throw "stdout: " + out.stdout }
                        if out.status != 0 { throw "status" }"#)
                .expect("script runs");
        })
        .await
        .expect("join");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn archives_round_trip_through_host_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().display().to_string();
        std::fs::write(dir.path().join("payload.txt"), "archive me").expect("write");

        let mut engine = ScriptEngine::new(local_host());
        let script = format!(
            r#"zip_compress("{base}/payload.txt", "{base}/payload.zip");
               zip_decompress("{base}/payload.zip", "{base}/from_zip");
               if file_read("{base}/from_zip/payload.txt") != "archive me" {{ throw "zip" }}
               tar_compress("{base}/payload.txt", "{base}");
               tar_decompress("{base}/payload.txt.tar", "{base}/from_tar");
               if file_read("{base}/from_tar/payload.txt") != "archive me" {{ throw "tar" }}
               gzip_compress("{base}/payload.txt", "{base}");
               gzip_decompress("{base}/payload.txt.gz", "{base}/from_gzip");
               if file_read("{base}/from_gzip/payload.txt") != "archive me" {{ throw "gzip" }}"#
        );
        tokio::task::spawn_blocking(move || {
            engine.run(&script).expect("archive round trips");
        })
        .await
        .expect("join");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zipping_a_directory_keeps_its_name_as_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().display().to_string();
        std::fs::create_dir_all(dir.path().join("bundle/sub")).expect("mkdir");
        std::fs::write(dir.path().join("bundle/sub/a.txt"), "A").expect("write");

        let mut engine = ScriptEngine::new(local_host());
        let script = format!(
            r#"zip_compress("{base}/bundle", "{base}/bundle.zip");
               zip_decompress("{base}/bundle.zip", "{base}/out");
               if file_read("{base}/out/bundle/sub/a.txt") != "A" {{ throw "prefix" }}"#
        );
        tokio::task::spawn_blocking(move || {
            engine.run(&script).expect("directory zip round trips");
        })
        .await
        .expect("join");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_failures_surface_as_script_errors() {
        let mut engine = ScriptEngine::new(local_host());
        let err = tokio::task::spawn_blocking(move || {
            engine.run(r#"http_get("http://127.0.0.1:9/")"#).unwrap_err()
        })
        .await
        .expect("join");
        assert!(err.contains("http_get"), "got: {err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_agent_fails_cleanly() {
        let mut engine = ScriptEngine::new(local_host());
        let err = tokio::task::spawn_blocking(move || {
            engine.run(r#"agent("nowhere", "log(1)")"#).unwrap_err()
        })
        .await
        .expect("join");
        assert!(err.contains("not found"), "got: {err}");
    }
}
