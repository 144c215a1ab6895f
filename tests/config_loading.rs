use std::io::Write;

use dagstep_core::config::EngineConfig;
use dagstep_core::types::{BuildContext, Step};
use dagstep_core::ErrorKind;
use dagstep_executors::builtin::s3::S3Config;
use dagstep_executors::builtin::ssh::SshConfig;
use dagstep_test_utils::{s3_step, ssh_step};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[log]
filter = "dagstep=debug"

[defaults.s3]
region = "us-east-1"
bucket = "dag-bucket"
endpoint = "http://minio:9000"
forcePathStyle = true
maxKeys = "250"

[defaults.ssh]
user = "ops"
ip = "10.0.0.7"
port = "2222"
timeout = "1m"

[variables]
ENVIRONMENT = "staging"
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(toml_content.as_bytes()).unwrap();

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.log.filter, "dagstep=debug");
    assert_eq!(config.variables["ENVIRONMENT"], "staging");

    let ctx = BuildContext::new(config.defaults.clone());

    let s3 = S3Config::resolve(&ctx, &s3_step("up", "upload", serde_json::json!({"bucket": "step-bucket"})))
        .unwrap();
    assert_eq!(s3.bucket, "step-bucket");
    assert_eq!(s3.region, "us-east-1");
    assert_eq!(s3.endpoint, "http://minio:9000");
    assert!(s3.force_path_style);
    assert_eq!(s3.max_keys, 250);

    let ssh = SshConfig::resolve(&ctx, &ssh_step("remote", "uptime", serde_json::json!({}))).unwrap();
    assert_eq!(ssh.user, "ops");
    assert_eq!(ssh.host, "10.0.0.7");
    assert_eq!(ssh.port, 2222);
    assert_eq!(ssh.connect_timeout().unwrap().as_secs(), 60);
}

#[test]
fn test_env_var_expansion_in_defaults() {
    std::env::set_var("DAGSTEP_TEST_SECRET_KEY", "from-env");
    let toml_content = r#"
[defaults.s3]
secretAccessKey = "${DAGSTEP_TEST_SECRET_KEY}"
sessionToken = "${DAGSTEP_TEST_UNSET_VAR}"
"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(toml_content.as_bytes()).unwrap();

    let config = EngineConfig::load(file.path()).unwrap();
    let ctx = BuildContext::new(config.defaults);
    let s3 = S3Config::resolve(&ctx, &s3_step("ls", "list", serde_json::json!({}))).unwrap();
    assert_eq!(s3.secret_access_key, "from-env");
    assert_eq!(s3.session_token, "${DAGSTEP_TEST_UNSET_VAR}");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"").unwrap();

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.log.filter, "dagstep=info,warn");
    assert!(config.defaults.is_empty());
    assert!(config.variables.is_empty());
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.toml");

    let err = EngineConfig::load(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("missing.toml"));

    let config = EngineConfig::load_or_default(&path).unwrap();
    assert!(config.defaults.is_empty());
}

#[test]
fn test_malformed_config_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[log\nfilter = 1").unwrap();
    assert!(EngineConfig::load(file.path()).is_err());
}

#[test]
fn test_step_file_parses_router_table() {
    let step: Step = toml::from_str(
        r#"
name = "route"

[router]
value = "${STATUS}"
mode = "multi-select"
default = ["fallback"]

[router.routes]
"/^deploy/" = ["notify"]
"[a, b]" = ["audit"]
"#,
    )
    .unwrap();

    assert_eq!(step.executor_type(), "router");
    let router = step.router.unwrap();
    let patterns: Vec<_> = router.routes.keys().cloned().collect();
    assert_eq!(patterns, vec!["/^deploy/", "[a, b]"]);
    router.compile().unwrap();
}
