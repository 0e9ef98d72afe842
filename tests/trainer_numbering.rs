mod test_support;

use serde_json::json;
use test_support::{bootstrap, branch_with_head, spawn_sidecar, str_field, PASSWORD};

#[test]
fn employee_ids_continue_past_large_manual_numbers() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-trainer-numbering");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");

    let first = sc.ok(
        "trainers.create",
        Some(&salem.head_token),
        json!({ "email": "t1@campus.test", "password": PASSWORD, "fullName": "First" }),
    );
    assert_eq!(str_field(&first, "/trainer/employeeId"), "EMP-SLM-0001");

    sc.ok(
        "trainers.create",
        Some(&salem.head_token),
        json!({
            "email": "t2@campus.test",
            "password": PASSWORD,
            "fullName": "Manual",
            "employeeId": "EMP-SLM-4294967295",
        }),
    );
    let next = sc.ok(
        "trainers.create",
        Some(&salem.head_token),
        json!({ "email": "t3@campus.test", "password": PASSWORD, "fullName": "Next" }),
    );
    assert_eq!(str_field(&next, "/trainer/employeeId"), "EMP-SLM-4294967296");

    // The process keeps serving after the large numbers.
    let list = sc.ok("trainers.list", Some(&salem.head_token), json!({}));
    assert_eq!(list.get("trainers").and_then(|v| v.as_array()).map(|a| a.len()), Some(3));
}
