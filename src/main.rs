fn main() {
    if let Err(e) = pio_bridge_lib::run() {
        eprintln!("pio-bridge: {}", e);
        std::process::exit(1);
    }
}
