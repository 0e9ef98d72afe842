mod test_support;

use serde_json::json;
use test_support::{bootstrap, branch_with_head, enrolled_student, spawn_sidecar, str_field, PASSWORD};

#[test]
fn periods_are_distinct_rows_and_repeat_marks_update_in_place() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-attendance-periods");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");
    let head = salem.head_token.clone();
    let (_, student_id) = enrolled_student(&mut sc, &head, &salem.course_id, "asha@campus.test");

    let mark = |period: i64, status: &str| {
        json!({
            "studentId": student_id,
            "courseId": salem.course_id,
            "date": "2024-03-04",
            "period": period,
            "status": status,
        })
    };

    let p1 = sc.ok("attendance.mark", Some(&head), mark(1, "PRESENT"));
    let p2 = sc.ok("attendance.mark", Some(&head), mark(2, "ABSENT"));
    assert_eq!(p1.get("created").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(p2.get("created").and_then(|v| v.as_bool()), Some(true));
    assert_ne!(p1.get("id"), p2.get("id"));

    let again = sc.ok("attendance.mark", Some(&head), mark(1, "ABSENT"));
    assert_eq!(again.get("created").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(again.get("id"), p1.get("id"));

    let rows = sc.ok(
        "attendance.list",
        Some(&head),
        json!({ "studentId": student_id, "from": "2024-03-04", "to": "2024-03-04" }),
    );
    let rows = rows.get("attendance").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .all(|r| r.get("status").and_then(|v| v.as_str()) == Some("ABSENT")));

    // Strict insert on an existing key reports the constraint, leaving the row alone.
    assert_eq!(
        sc.err("attendance.create", Some(&head), mark(2, "PRESENT")),
        "unique_violation"
    );
    sc.ok("attendance.create", Some(&head), mark(3, "PRESENT"));

    let summary = sc.ok(
        "attendance.summary",
        Some(&head),
        json!({ "from": "2024-03-01", "to": "2024-03-31" }),
    );
    assert_eq!(summary.pointer("/students/0/present").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(summary.pointer("/students/0/absent").and_then(|v| v.as_i64()), Some(2));
}

#[test]
fn marks_are_validated_against_setup_and_enrollment() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-attendance-validation");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");
    let head = salem.head_token.clone();
    let (_, student_id) = enrolled_student(&mut sc, &head, &salem.course_id, "ravi@campus.test");
    let other_course = sc.ok(
        "courses.create",
        Some(&head),
        json!({ "code": "JV", "name": "Java" }),
    );
    let other_course_id = str_field(&other_course, "/course/id");

    let base = json!({
        "studentId": student_id,
        "courseId": salem.course_id,
        "date": "2024-03-04",
        "period": 1,
        "status": "P",
    });
    let with = |key: &str, value: serde_json::Value| {
        let mut p = base.clone();
        p[key] = value;
        p
    };

    assert_eq!(sc.err("attendance.mark", Some(&head), with("period", json!(9))), "bad_params");
    assert_eq!(sc.err("attendance.mark", Some(&head), with("period", json!(0))), "bad_params");
    assert_eq!(
        sc.err("attendance.mark", Some(&head), with("date", json!("2024-02-30"))),
        "bad_params"
    );
    assert_eq!(
        sc.err("attendance.mark", Some(&head), with("date", json!("2999-01-01"))),
        "bad_params"
    );
    assert_eq!(
        sc.err("attendance.mark", Some(&head), with("courseId", json!(other_course_id))),
        "bad_params"
    );

    // Widening the day and allowing future dates makes the same marks valid.
    sc.ok(
        "setup.update",
        Some(&ceo),
        json!({ "section": "attendance", "patch": { "periodsPerDay": 10, "allowFutureDates": true } }),
    );
    sc.ok("attendance.mark", Some(&head), with("period", json!(9)));
    sc.ok("attendance.mark", Some(&head), with("date", json!("2999-01-01")));
    assert_eq!(
        sc.err(
            "setup.update",
            Some(&ceo),
            json!({ "section": "attendance", "patch": { "periodsPerDay": 13 } }),
        ),
        "bad_params"
    );

    // Students can read but not write.
    let student_token = sc.login("ravi@campus.test", PASSWORD);
    assert_eq!(sc.err("attendance.mark", Some(&student_token), base.clone()), "forbidden");
    let own = sc.ok("attendance.list", Some(&student_token), json!({}));
    assert_eq!(own.get("attendance").and_then(|v| v.as_array()).map(|a| a.len()), Some(2));
}

#[test]
fn bulk_mark_covers_the_batch_in_one_call() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-attendance-bulk");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");
    let head = salem.head_token.clone();
    let batch = sc.ok(
        "batches.create",
        Some(&head),
        json!({ "courseId": salem.course_id, "name": "Morning", "startTime": "09:00", "endTime": "11:00" }),
    );
    let batch_id = str_field(&batch, "/batch/id");
    let mut students = Vec::new();
    for email in ["a@campus.test", "b@campus.test", "c@campus.test"] {
        let (_, id) = enrolled_student(&mut sc, &head, &salem.course_id, email);
        sc.ok(
            "batches.assignStudent",
            Some(&head),
            json!({ "studentId": id, "batchId": batch_id }),
        );
        students.push(id);
    }

    let params = json!({
        "batchId": batch_id,
        "date": "2024-05-06",
        "period": 2,
        "absentStudentIds": [students[1]],
    });
    let first = sc.ok("attendance.bulkMark", Some(&head), params.clone());
    assert_eq!(first.get("created").and_then(|v| v.as_u64()), Some(3));
    let second = sc.ok("attendance.bulkMark", Some(&head), params);
    assert_eq!(second.get("created").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(second.get("updated").and_then(|v| v.as_u64()), Some(3));

    let rows = sc.ok("attendance.list", Some(&head), json!({ "batchId": batch_id }));
    let rows = rows.get("attendance").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 3);
    let absent: Vec<_> = rows
        .iter()
        .filter(|r| r.get("status").and_then(|v| v.as_str()) == Some("ABSENT"))
        .collect();
    assert_eq!(absent.len(), 1);
    let ids: Vec<String> = rows.iter().map(|r| str_field(r, "/id")).collect();

    let verified = sc.ok(
        "attendance.verify",
        Some(&head),
        json!({ "attendanceIds": ids }),
    );
    assert_eq!(verified.get("verified").and_then(|v| v.as_u64()), Some(3));

    let trend = sc.ok(
        "dashboard.attendance",
        Some(&head),
        json!({ "from": "2024-05-05", "to": "2024-05-07" }),
    );
    let days = trend.get("days").and_then(|v| v.as_array()).expect("days");
    assert_eq!(days.len(), 3);
    assert_eq!(days[1].get("present").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(days[0].get("present").and_then(|v| v.as_i64()), Some(0));
}

#[test]
fn trainers_mark_only_students_of_their_own_batches() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-attendance-trainer");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");
    let head = salem.head_token.clone();
    let trainer = sc.ok(
        "trainers.create",
        Some(&head),
        json!({ "email": "tara@campus.test", "password": PASSWORD, "fullName": "Tara" }),
    );
    let trainer_id = str_field(&trainer, "/trainer/id");
    let own_batch = sc.ok(
        "batches.create",
        Some(&head),
        json!({ "courseId": salem.course_id, "name": "Morning", "startTime": "09:00", "endTime": "11:00", "trainerId": trainer_id }),
    );
    let other_batch = sc.ok(
        "batches.create",
        Some(&head),
        json!({ "courseId": salem.course_id, "name": "Evening", "startTime": "17:00", "endTime": "19:00" }),
    );
    let (_, mine) = enrolled_student(&mut sc, &head, &salem.course_id, "mine@campus.test");
    let (_, theirs) = enrolled_student(&mut sc, &head, &salem.course_id, "theirs@campus.test");
    let (_, unassigned) = enrolled_student(&mut sc, &head, &salem.course_id, "loose@campus.test");
    for (student, batch) in [(&mine, &own_batch), (&theirs, &other_batch)] {
        sc.ok(
            "batches.assignStudent",
            Some(&head),
            json!({ "studentId": student, "batchId": str_field(batch, "/batch/id") }),
        );
    }

    let token = sc.login("tara@campus.test", PASSWORD);
    let mark = |student: &str| {
        json!({
            "studentId": student,
            "courseId": salem.course_id,
            "date": "2024-03-04",
            "period": 1,
            "status": "PRESENT",
        })
    };
    sc.ok("attendance.mark", Some(&token), mark(&mine));
    assert_eq!(sc.err("attendance.mark", Some(&token), mark(&theirs)), "forbidden");
    assert_eq!(sc.err("attendance.create", Some(&token), mark(&theirs)), "forbidden");
    assert_eq!(sc.err("attendance.mark", Some(&token), mark(&unassigned)), "forbidden");
    assert_eq!(
        sc.err(
            "attendance.bulkMark",
            Some(&token),
            json!({ "batchId": str_field(&other_batch, "/batch/id"), "date": "2024-03-04", "period": 1 }),
        ),
        "forbidden"
    );
    // Branch heads are not tied to a batch.
    sc.ok("attendance.mark", Some(&head), mark(&theirs));
}
