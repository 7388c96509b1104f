fn main() -> anyhow::Result<()> {
    guide_daemon::run()
}
