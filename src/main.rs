fn main() -> anyhow::Result<()> {
    blink_store_lib::run()
}
