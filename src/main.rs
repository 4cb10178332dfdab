fn main() -> std::process::ExitCode {
    mosa_db::run()
}
