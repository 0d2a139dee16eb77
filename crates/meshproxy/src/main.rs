fn main() {
    if let Err(err) = meshproxy_app::run() {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}
