fn main() -> Result<(), Box<dyn std::error::Error>> {
    syntra::cli::main()
}
