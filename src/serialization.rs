pub const fn default_true() -> bool {
    true
}
