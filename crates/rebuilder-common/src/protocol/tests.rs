use super::*;

#[test]
fn error_frame_round_trips_kind_and_message() {
    let err = RebuilderError::Overloaded("maximum concurrent builds reached".into());
    let frame = Response::from_error(&err);
    let back = frame.into_result().unwrap_err();
    assert_eq!(back.wire_kind(), ErrorKind::Overloaded);
    assert_eq!(back.to_string(), err.to_string());
}

#[test]
fn non_error_frames_pass_through() {
    let frame = Response::Granted {
        lease_id: "build123".into(),
        worker_addr: "localhost:12311".into(),
    };
    assert_eq!(frame.clone().into_result().unwrap(), frame);
}

#[test]
fn overloaded_is_transient_locally_and_remotely() {
    let local = RebuilderError::Overloaded("full".into());
    assert!(local.is_transient());
    let remote = Response::from_error(&local).into_result().unwrap_err();
    assert!(remote.is_transient());
}

#[test]
fn connection_errors_are_transient() {
    assert!(RebuilderError::Connection("reset by peer".into()).is_transient());
}

#[test]
fn fatal_errors_are_not_transient() {
    assert!(!RebuilderError::InvalidLease("bogus".into()).is_transient());
    assert!(!RebuilderError::PathTraversal("../etc/passwd".into()).is_transient());
    assert!(!RebuilderError::NotFound("no build started".into()).is_transient());
    let remote = Response::from_error(&RebuilderError::InvalidLease("bogus".into()))
        .into_result()
        .unwrap_err();
    assert!(!remote.is_transient());
}

#[test]
fn wire_kind_maps_every_variant() {
    assert_eq!(
        RebuilderError::InvalidRequest("no package".into()).wire_kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        RebuilderError::Unimplemented("clean".into()).wire_kind(),
        ErrorKind::Unimplemented
    );
    assert_eq!(
        RebuilderError::Transport("boom".into()).wire_kind(),
        ErrorKind::Internal
    );
}

#[test]
fn messages_encode_with_postcard() {
    let req = Request::Start {
        lease_id: "build42".into(),
        package: "hello_2.10-1".into(),
        distribution: "sid".into(),
        extra_artifacts: vec!["hello_2.10-1_amd64.deb".into()],
    };
    let bytes = postcard::to_stdvec(&req).unwrap();
    let back: Request = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(back, req);
}
