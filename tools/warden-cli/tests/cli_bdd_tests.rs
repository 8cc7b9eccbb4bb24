//! BDD Tests for the warden CLI

use cucumber::{given, then, when, World};
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

#[derive(Debug, World)]
#[world(init = Self::new)]
struct CliWorld {
    dir: TempDir,
    config: Option<PathBuf>,
    output: Option<Output>,
}

impl CliWorld {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temporary directory"),
            config: None,
            output: None,
        }
    }

    fn output(&self) -> &Output {
        self.output.as_ref().expect("a command was run")
    }
}

fn warden(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_warden"))
        .args(args)
        .output()
        .expect("warden binary runs")
}

#[given(expr = "a configuration file with subnet {string}")]
async fn given_config(world: &mut CliWorld, subnet: String) {
    let path = world.dir.path().join("config.yaml");
    let contents = format!(
        r#"
connections:
  - name: hq
    auth: {{type: psk, value: secret}}
    encryption: {{ike: aes256-sha256-dh14, esp: aes256gcm16}}
    local_subnets: ["{subnet}"]
    remote_subnets: [192.168.0.0/16]
logging_type: stdout
"#
    );
    std::fs::write(&path, contents).unwrap();
    world.config = Some(path);
}

#[when(expr = "I run {string} on it")]
async fn when_run_on_config(world: &mut CliWorld, command: String) {
    let path = world.config.clone().expect("a configuration file");
    world.output = Some(warden(&[&command, path.to_str().unwrap()]));
}

#[when(expr = "I run warden with {string}")]
async fn when_run(world: &mut CliWorld, args: String) {
    let args: Vec<&str> = args.split_whitespace().collect();
    world.output = Some(warden(&args));
}

#[then("the command should succeed")]
async fn then_success(world: &mut CliWorld) {
    let output = world.output();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[then("the command should fail")]
async fn then_failure(world: &mut CliWorld) {
    assert!(!world.output().status.success());
}

#[then(expr = "the output should contain {string}")]
async fn then_stdout(world: &mut CliWorld, fragment: String) {
    let stdout = String::from_utf8_lossy(&world.output().stdout);
    assert!(stdout.contains(&fragment), "{stdout}");
}

#[then(expr = "the error output should contain {string}")]
async fn then_stderr(world: &mut CliWorld, fragment: String) {
    let stderr = String::from_utf8_lossy(&world.output().stderr);
    assert!(stderr.contains(&fragment), "{stderr}");
}

#[tokio::main]
async fn main() {
    CliWorld::run("tests/features").await;
}
