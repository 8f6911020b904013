fn main() {
    generator::main();
}
