mod test_support;

use serde_json::json;
use test_support::{bootstrap, branch_with_head, spawn_sidecar, str_field, CEO_EMAIL, PASSWORD};

#[test]
fn bootstrap_then_login_issues_a_working_token() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-auth-login");

    // Only the first CEO can be bootstrapped.
    assert_eq!(
        sc.err(
            "setup.bootstrap",
            None,
            json!({ "email": "second@campus.test", "password": PASSWORD, "fullName": "Second" }),
        ),
        "forbidden"
    );

    let me = sc.ok("auth.me", Some(&ceo), json!({}));
    assert_eq!(str_field(&me, "/user/email"), CEO_EMAIL);
    assert_eq!(str_field(&me, "/user/role"), "CEO");
    assert!(me.pointer("/user/branchId").map(|v| v.is_null()).unwrap_or(false));

    // Email match is case-insensitive; wrong passwords and unknown emails look the same.
    sc.login("  CEO@Campus.Test ", PASSWORD);
    let wrong = sc.request(
        "auth.login",
        None,
        json!({ "email": CEO_EMAIL, "password": "nope-nope-nope" }),
    );
    let unknown = sc.request(
        "auth.login",
        None,
        json!({ "email": "ghost@campus.test", "password": PASSWORD }),
    );
    assert_eq!(str_field(&wrong, "/error/code"), "unauthorized");
    assert_eq!(
        wrong.pointer("/error/message"),
        unknown.pointer("/error/message")
    );
}

#[test]
fn deactivated_users_lose_access_immediately() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-auth-deactivate");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");

    sc.ok("auth.me", Some(&salem.head_token), json!({}));
    let users = sc.ok(
        "users.list",
        Some(&ceo),
        json!({ "role": "BRANCH_HEAD" }),
    );
    let head_id = str_field(&users, "/users/0/id");
    sc.ok(
        "users.setActive",
        Some(&ceo),
        json!({ "userId": head_id, "active": false }),
    );
    assert_eq!(
        sc.err("auth.me", Some(&salem.head_token), json!({})),
        "unauthorized"
    );
    assert_eq!(
        sc.err(
            "auth.login",
            None,
            json!({ "email": salem.head_email, "password": PASSWORD })
        ),
        "unauthorized"
    );
}

#[test]
fn role_gates_and_password_reset() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-auth-roles");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");

    // Student and trainer accounts only come from their own creation paths.
    assert_eq!(
        sc.err(
            "users.create",
            Some(&ceo),
            json!({ "email": "s@campus.test", "password": PASSWORD, "fullName": "S", "role": "STUDENT", "branchId": salem.branch_id }),
        ),
        "bad_params"
    );
    // CHANNEL_PARTNER is the old name for a branch head.
    let legacy = sc.ok(
        "users.create",
        Some(&ceo),
        json!({ "email": "cp@campus.test", "password": PASSWORD, "fullName": "CP", "role": "CHANNEL_PARTNER", "branchId": salem.branch_id }),
    );
    assert_eq!(str_field(&legacy, "/user/role"), "BRANCH_HEAD");

    // Branch heads cannot create users or branches, nor reset other heads.
    assert_eq!(
        sc.err(
            "branches.create",
            Some(&salem.head_token),
            json!({ "name": "X", "code": "X" })
        ),
        "forbidden"
    );
    assert_eq!(
        sc.err(
            "users.resetPassword",
            Some(&salem.head_token),
            json!({ "email": "cp@campus.test", "newPassword": "another-pass-9" })
        ),
        "forbidden"
    );

    sc.ok(
        "maintenance.credentials.reset",
        Some(&ceo),
        json!({ "email": "cp@campus.test", "newPassword": "another-pass-9" }),
    );
    let check = sc.ok(
        "maintenance.credentials.verify",
        Some(&ceo),
        json!({ "email": "cp@campus.test", "password": "another-pass-9" }),
    );
    assert_eq!(check.get("valid").and_then(|v| v.as_bool()), Some(true));
    let stale = sc.ok(
        "maintenance.credentials.verify",
        Some(&ceo),
        json!({ "email": "cp@campus.test", "password": PASSWORD }),
    );
    assert_eq!(stale.get("valid").and_then(|v| v.as_bool()), Some(false));
}
