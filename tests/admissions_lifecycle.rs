mod test_support;

use serde_json::json;
use test_support::{bootstrap, branch_with_head, enrolled_student, spawn_sidecar, str_field};

#[test]
fn delete_is_refused_while_a_student_depends_on_it() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-admissions-delete");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");
    let head = salem.head_token.clone();

    let (enrolled, _) = enrolled_student(&mut sc, &head, &salem.course_id, "kept@campus.test");
    let resp = sc.request(
        "admissions.delete",
        Some(&head),
        json!({ "admissionId": enrolled }),
    );
    assert_eq!(str_field(&resp, "/error/code"), "has_dependents");
    assert_eq!(str_field(&resp, "/error/details/dependents"), "student");
    sc.ok("admissions.get", Some(&head), json!({ "admissionId": enrolled }));

    let spare = sc.ok(
        "admissions.create",
        Some(&head),
        json!({ "courseId": salem.course_id, "fullName": "Spare", "phone": "9000000001" }),
    );
    let spare_id = str_field(&spare, "/admission/id");
    sc.ok("admissions.delete", Some(&head), json!({ "admissionId": spare_id }));
    assert_eq!(
        sc.err("admissions.get", Some(&head), json!({ "admissionId": spare_id })),
        "not_found"
    );
}

#[test]
fn admission_numbers_and_status_transitions() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-admissions-status");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");
    let head = salem.head_token.clone();

    let create = |name: &str| {
        json!({ "courseId": salem.course_id, "fullName": name, "totalFee": 500.0, "feePaid": 100.0 })
    };
    let a = sc.ok("admissions.create", Some(&head), create("A"));
    let b = sc.ok("admissions.create", Some(&head), create("B"));
    let a_no = str_field(&a, "/admission/admissionNo");
    let b_no = str_field(&b, "/admission/admissionNo");
    assert!(a_no.starts_with("ADM-SLM-") && a_no.ends_with("-0001"), "{}", a_no);
    assert!(b_no.ends_with("-0002"), "{}", b_no);
    let a_id = str_field(&a, "/admission/id");

    // ENROLLED is only reachable through students.enroll, and enroll needs APPROVED.
    let status = |id: &str, s: &str| json!({ "admissionId": id, "status": s });
    assert_eq!(
        sc.err("admissions.setStatus", Some(&head), status(&a_id, "ENROLLED")),
        "invalid_transition"
    );
    assert_eq!(
        sc.err("students.enroll", Some(&head), json!({ "admissionId": a_id, "email": "a@campus.test", "password": "long-enough-1" })),
        "invalid_transition"
    );
    sc.ok("admissions.setStatus", Some(&head), status(&a_id, "REJECTED"));
    assert_eq!(
        sc.err("admissions.setStatus", Some(&head), status(&a_id, "APPROVED")),
        "invalid_transition"
    );

    assert_eq!(
        sc.err("admissions.create", Some(&head), json!({ "courseId": salem.course_id, "fullName": "C", "totalFee": 10.0, "feePaid": 20.0 })),
        "bad_params"
    );

    // The prefix comes from setup.
    sc.ok(
        "setup.update",
        Some(&ceo),
        json!({ "section": "admissions", "patch": { "numberPrefix": "FC" } }),
    );
    let c = sc.ok("admissions.create", Some(&head), create("C"));
    assert!(str_field(&c, "/admission/admissionNo").starts_with("FC-SLM-"));
}

#[test]
fn lead_conversion_creates_the_admission() {
    let mut sc = spawn_sidecar();
    let (_ws, ceo) = bootstrap(&mut sc, "campusd-leads-convert");
    let salem = branch_with_head(&mut sc, &ceo, "SLM");
    let head = salem.head_token.clone();

    let lead = sc.ok(
        "leads.create",
        Some(&head),
        json!({ "fullName": "Meena", "email": "Meena@Campus.Test", "source": "REFERRAL" }),
    );
    let lead_id = str_field(&lead, "/lead/id");
    assert_eq!(str_field(&lead, "/lead/email"), "meena@campus.test");
    assert_eq!(
        sc.err("leads.setStatus", Some(&head), json!({ "leadId": lead_id, "status": "INTERESTED" })),
        "invalid_transition"
    );
    sc.ok("leads.setStatus", Some(&head), json!({ "leadId": lead_id, "status": "CONTACTED" }));
    sc.ok("leads.setStatus", Some(&head), json!({ "leadId": lead_id, "status": "INTERESTED" }));
    assert_eq!(
        sc.err("leads.setStatus", Some(&head), json!({ "leadId": lead_id, "status": "CONVERTED" })),
        "invalid_transition"
    );
    assert_eq!(
        sc.err("leads.convert", Some(&head), json!({ "leadId": lead_id })),
        "bad_params"
    );

    let converted = sc.ok(
        "leads.convert",
        Some(&head),
        json!({ "leadId": lead_id, "courseId": salem.course_id, "totalFee": 15000.0 }),
    );
    assert_eq!(str_field(&converted, "/lead/status"), "CONVERTED");
    assert_eq!(str_field(&converted, "/admission/status"), "NEW");
    assert_eq!(str_field(&converted, "/admission/leadId"), lead_id);
    assert_eq!(str_field(&converted, "/admission/email"), "meena@campus.test");
    assert_eq!(
        str_field(&converted, "/lead/admissionId"),
        str_field(&converted, "/admission/id")
    );

    assert_eq!(
        sc.err("leads.convert", Some(&head), json!({ "leadId": lead_id })),
        "invalid_transition"
    );
    assert_eq!(
        sc.err("leads.update", Some(&head), json!({ "leadId": lead_id, "notes": "x" })),
        "bad_params"
    );
}
