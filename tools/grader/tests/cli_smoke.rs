use assert_cmd::cargo::cargo_bin_cmd;

fn fixture(path: &str) -> String {
    format!("{}/tests/fixtures/{path}", env!("CARGO_MANIFEST_DIR"))
}

#[test]
fn help_lists_grading_flags() {
    let mut cmd = cargo_bin_cmd!("grader");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert!(stdout.contains("--suite"));
    assert!(stdout.contains("--protocol"));
    assert!(stdout.contains("--validate-only"));
}

#[test]
fn validate_only_loads_every_case() {
    let work = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("grader");
    cmd.current_dir(work.path())
        .arg("--validate-only")
        .arg("--client")
        .arg(fixture("bin/client.sh"))
        .arg("--server")
        .arg(fixture("bin/server.sh"))
        .arg("--suite")
        .arg(fixture("suites/http_basic"));
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert!(stdout.contains("suite ok: 2 cases, protocol HTTP"), "{stdout}");
    assert!(work.path().join(".cache/grader/run.jsonl").exists());
}

#[test]
fn validate_only_honours_config_file_and_protocol_flag() {
    let work = tempfile::tempdir().expect("tempdir");
    let config = work.path().join("grader.toml");
    std::fs::write(
        &config,
        format!(
            "[executables]\nclient = \"{}\"\nserver = \"{}\"\n\n[suite]\npath = \"{}\"\n",
            fixture("bin/client.sh"),
            fixture("bin/server.sh"),
            fixture("suites/http_basic/suite.toml"),
        ),
    )
    .expect("write config");

    let mut cmd = cargo_bin_cmd!("grader");
    cmd.current_dir(work.path())
        .arg("--validate-only")
        .arg("--config")
        .arg(&config)
        .arg("--protocol")
        .arg("tcp");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert!(stdout.contains("protocol TCP"), "{stdout}");
}

#[test]
fn missing_executable_is_a_configuration_error() {
    let work = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("grader");
    cmd.current_dir(work.path())
        .arg("--validate-only")
        .arg("--client")
        .arg(work.path().join("nope"))
        .arg("--server")
        .arg(fixture("bin/server.sh"))
        .arg("--suite")
        .arg(fixture("suites/http_basic"));
    let out = cmd.assert().failure();
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");

    assert!(stderr.contains("client executable path does not exist"), "{stderr}");
}

#[test]
fn out_of_order_stages_fail_validation() {
    let work = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("grader");
    cmd.current_dir(work.path())
        .arg("--validate-only")
        .arg("--client")
        .arg(fixture("bin/client.sh"))
        .arg("--server")
        .arg(fixture("bin/server.sh"))
        .arg("--suite")
        .arg(fixture("suites/bad_stage"));
    let out = cmd.assert().failure();
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");

    assert!(stderr.contains("stage 1 follows stage 2"), "{stderr}");
}

#[test]
fn unknown_protocol_flag_is_rejected() {
    let mut cmd = cargo_bin_cmd!("grader");
    cmd.arg("--protocol").arg("udp");
    cmd.assert().failure();
}
