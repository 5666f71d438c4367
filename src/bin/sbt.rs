fn main() {
    std::process::exit(sbt_cli::exec());
}
