fn main() -> Result<(), Box<dyn std::error::Error>> {
    mcpeek::cli::main()
}
