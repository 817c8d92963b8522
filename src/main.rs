use luahost::config::HostConfig;

fn main() {
    let mut cfg = HostConfig::load();
    if std::env::args().any(|a| a == "--offline") {
        cfg.listen = false;
    }
    luahost::build_app(&cfg).run();
}
