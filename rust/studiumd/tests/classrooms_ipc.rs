mod test_support;

use serde_json::json;
use test_support::{
    create_user, error_code, request_err, request_ok, select_workspace, spawn_sidecar, str_field,
};

#[test]
fn classroom_create_assigns_teacher_and_students() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = select_workspace(&mut stdin, &mut reader, "studium-classrooms");

    let teacher_id = create_user(&mut stdin, &mut reader, "1", "Mr Chips", "chips@school.edu", "Teacher");
    let s1 = create_user(&mut stdin, &mut reader, "2", "Ben", "ben@school.edu", "Student");
    let s2 = create_user(&mut stdin, &mut reader, "3", "Amy", "amy@school.edu", "Student");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classrooms.create",
        json!({
            "name": "Year 7",
            "teacherId": teacher_id,
            "studentIds": [s1, s2, s1],
            "schedule": [
                { "day": "tue", "startTime": "8:30", "endTime": "12:00" },
                { "day": "Thursday", "startTime": "13:00", "endTime": "16:45" }
            ]
        }),
    );
    let classroom_id = str_field(&created, "classroomId");
    let classroom = &created["classroom"];
    assert_eq!(classroom["name"], json!("Year 7"));
    assert_eq!(classroom["teacher"]["id"], json!(teacher_id));
    assert_eq!(classroom["studentCount"], json!(2));
    assert_eq!(
        classroom["schedule"],
        json!([
            { "day": "Tuesday", "startTime": "08:30", "endTime": "12:00" },
            { "day": "Thursday", "startTime": "13:00", "endTime": "16:45" }
        ])
    );

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.list",
        json!({ "classroomId": classroom_id, "role": "Student" }),
    );
    assert_eq!(students["users"].as_array().map(|a| a.len()), Some(2));

    let listed = request_ok(&mut stdin, &mut reader, "6", "classrooms.list", json!({}));
    assert_eq!(listed["classrooms"].as_array().map(|a| a.len()), Some(1));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classrooms.get",
        json!({ "classroomId": classroom_id }),
    );
    assert_eq!(got["classroom"]["id"], json!(classroom_id));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn classroom_create_rejects_bad_schedules_and_wrong_roles() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = select_workspace(&mut stdin, &mut reader, "studium-classrooms-reject");

    let teacher_id = create_user(&mut stdin, &mut reader, "1", "Ms T", "t@school.edu", "Teacher");
    let student_id = create_user(&mut stdin, &mut reader, "2", "Kid", "kid@school.edu", "Student");
    let monday = json!([{ "day": "Monday", "startTime": "09:00", "endTime": "15:00" }]);

    let cases = [
        (json!([]), None),
        (
            json!([{ "day": "Monday", "startTime": "15:00", "endTime": "09:00" }]),
            Some("invalid_window"),
        ),
        (
            json!([
                { "day": "Monday", "startTime": "09:00", "endTime": "10:00" },
                { "day": "monday", "startTime": "11:00", "endTime": "12:00" }
            ]),
            Some("duplicate_day"),
        ),
        (
            json!([{ "day": "Funday", "startTime": "09:00", "endTime": "10:00" }]),
            None,
        ),
        (
            json!([{ "day": "Monday", "startTime": "9am", "endTime": "10:00" }]),
            None,
        ),
    ];
    for (i, (schedule, reason)) in cases.into_iter().enumerate() {
        let e = request_err(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "classrooms.create",
            json!({ "name": "Bad", "teacherId": teacher_id, "schedule": schedule }),
        );
        assert_eq!(error_code(&e), "bad_params", "case {}", i);
        if let Some(reason) = reason {
            assert_eq!(e["details"]["reason"], json!(reason), "case {}", i);
        }
    }

    let e = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "classrooms.create",
        json!({ "name": "Bad", "teacherId": student_id, "schedule": monday }),
    );
    assert_eq!(error_code(&e), "not_found");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "classrooms.create",
        json!({
            "name": "Bad",
            "teacherId": teacher_id,
            "studentIds": [teacher_id],
            "schedule": monday
        }),
    );
    assert_eq!(error_code(&e), "not_found");
    assert_eq!(e["details"]["studentId"], json!(teacher_id));

    let listed = request_ok(&mut stdin, &mut reader, "5", "classrooms.list", json!({}));
    assert_eq!(listed["classrooms"], json!([]));

    let e = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "classrooms.get",
        json!({ "classroomId": "missing" }),
    );
    assert_eq!(error_code(&e), "not_found");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn a_teacher_cannot_take_a_second_classroom() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = select_workspace(&mut stdin, &mut reader, "studium-classrooms-busy");

    let teacher_id = create_user(&mut stdin, &mut reader, "1", "Ms Busy", "busy@school.edu", "Teacher");
    let monday = json!([{ "day": "Monday", "startTime": "09:00", "endTime": "15:00" }]);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classrooms.create",
        json!({ "name": "Room A", "teacherId": teacher_id, "schedule": monday }),
    );
    let room_a = str_field(&first, "classroomId");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "classrooms.create",
        json!({ "name": "Room B", "teacherId": teacher_id, "schedule": monday }),
    );
    assert_eq!(error_code(&e), "conflict");
    assert_eq!(e["details"]["classroomId"], json!(room_a));

    let listed = request_ok(&mut stdin, &mut reader, "4", "classrooms.list", json!({}));
    let rooms = listed["classrooms"].as_array().expect("classrooms");
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0]["teacherId"], json!(teacher_id));

    drop(stdin);
    let _ = child.wait();
}
