/// Mock-server tests need a loopback listener; some sandboxes refuse one.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping management API mock test: loopback bind denied");
            true
        }
        Err(err) => panic!("cannot bind loopback for mock server: {err}"),
    }
}
