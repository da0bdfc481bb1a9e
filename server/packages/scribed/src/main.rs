fn main() {
    if let Err(err) = scribed::cli::run_scribed() {
        tracing::error!(error = %err, "scribed failed");
        std::process::exit(1);
    }
}
