/// Lazily parses a configuration value from an environment variable,
/// with a fallback default value if the variable is not set or fails
/// to parse as the requested type.
///
/// # Parameters
///
/// - `$key`: An expression representing the name of the environment variable.
/// - `$t`: The type of the value to be parsed.
/// - `$default`: The default value to fall back to if the environment variable
///   is not set or parsing fails.
///
/// # Return Value
///
/// A lazy static variable of type `once_cell::sync::Lazy`, which holds the
/// parsed value from the environment variable or the default value.
macro_rules! lazy_env_parse {
	($key:expr, $t:ty, $default:expr) => {
		once_cell::sync::Lazy::new(|| {
			std::env::var($key)
				.ok()
				.and_then(|value| value.parse::<$t>().ok())
				.unwrap_or($default)
		})
	};
}
