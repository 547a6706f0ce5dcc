fn main() {
    studyhub_lib::run()
}
