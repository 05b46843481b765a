use reactor_web::{ServerConfig, WebServer};

fn main() {
    match WebServer::new(ServerConfig::default()) {
        Ok(mut server) => server.start(),
        Err(err) => eprintln!("server init failed: {err}"),
    }
}
