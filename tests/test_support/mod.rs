#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CEO_EMAIL: &str = "ceo@campus.test";
pub const PASSWORD: &str = "correct-horse-1";

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn spawn_sidecar() -> Sidecar {
    spawn_with_workspace(None)
}

pub fn spawn_with_workspace(workspace: Option<&Path>) -> Sidecar {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut cmd = Command::new(exe);
    cmd.env("CAMPUSD_SIGNING_SECRET", "integration-test-secret")
        .env_remove("CAMPUSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if let Some(ws) = workspace {
        cmd.env("CAMPUSD_WORKSPACE", ws);
    }
    let mut child = cmd.spawn().expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    Sidecar {
        child,
        stdin,
        reader: BufReader::new(stdout),
        next_id: 0,
    }
}

impl Sidecar {
    pub fn send_line(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, token: Option<&str>, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let mut payload = json!({ "id": id, "method": method, "params": params });
        if let Some(t) = token {
            payload["token"] = json!(t);
        }
        let value = self.send_line(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, method: &str, token: Option<&str>, params: Value) -> Value {
        let value = self.request(method, token, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Asserts failure and returns the error code.
    pub fn err(&mut self, method: &str, token: Option<&str>, params: Value) -> String {
        let value = self.request(method, token, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .expect("error code")
            .to_string()
    }

    pub fn login(&mut self, email: &str, password: &str) -> String {
        let res = self.ok(
            "auth.login",
            None,
            json!({ "email": email, "password": password }),
        );
        res.get("token")
            .and_then(|v| v.as_str())
            .expect("token")
            .to_string()
    }
}

pub fn str_field(v: &Value, pointer: &str) -> String {
    v.pointer(pointer)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", pointer, v))
        .to_string()
}

/// A workspace with one CEO, already selected. Returns the CEO token.
pub fn bootstrap(sc: &mut Sidecar, prefix: &str) -> (PathBuf, String) {
    let workspace = temp_dir(prefix);
    sc.ok(
        "workspace.select",
        None,
        json!({ "path": workspace.to_string_lossy() }),
    );
    sc.ok(
        "setup.bootstrap",
        None,
        json!({ "email": CEO_EMAIL, "password": PASSWORD, "fullName": "Chief" }),
    );
    let token = sc.login(CEO_EMAIL, PASSWORD);
    (workspace, token)
}

pub struct BranchFixture {
    pub branch_id: String,
    pub course_id: String,
    pub head_email: String,
    pub head_token: String,
}

/// Branch with one course and a branch head, created through the public methods.
pub fn branch_with_head(sc: &mut Sidecar, ceo: &str, code: &str) -> BranchFixture {
    let branch = sc.ok(
        "branches.create",
        Some(ceo),
        json!({ "name": format!("{} campus", code), "code": code }),
    );
    let branch_id = str_field(&branch, "/branch/id");
    let course = sc.ok(
        "courses.create",
        Some(ceo),
        json!({ "branchId": branch_id, "code": "PY", "name": "Python", "durationWeeks": 12, "fee": 15000.0 }),
    );
    let course_id = str_field(&course, "/course/id");
    let head_email = format!("head.{}@campus.test", code.to_ascii_lowercase());
    sc.ok(
        "users.create",
        Some(ceo),
        json!({
            "email": head_email,
            "password": PASSWORD,
            "fullName": format!("{} head", code),
            "role": "BRANCH_HEAD",
            "branchId": branch_id,
        }),
    );
    let head_token = sc.login(&head_email, PASSWORD);
    BranchFixture {
        branch_id,
        course_id,
        head_email,
        head_token,
    }
}

/// Admission created and approved, then enrolled. Returns (admission id, student id).
pub fn enrolled_student(
    sc: &mut Sidecar,
    token: &str,
    course_id: &str,
    email: &str,
) -> (String, String) {
    let adm = sc.ok(
        "admissions.create",
        Some(token),
        json!({ "courseId": course_id, "fullName": email, "email": email, "totalFee": 1000.0 }),
    );
    let admission_id = str_field(&adm, "/admission/id");
    sc.ok(
        "admissions.setStatus",
        Some(token),
        json!({ "admissionId": admission_id, "status": "APPROVED" }),
    );
    let student = sc.ok(
        "students.enroll",
        Some(token),
        json!({ "admissionId": admission_id, "password": PASSWORD }),
    );
    (admission_id, str_field(&student, "/student/id"))
}
