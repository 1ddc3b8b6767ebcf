fn main() {
    // Collect enabled cargo features so `build_info()` can report them.
    let mut features: Vec<String> = std::env::vars()
        .filter_map(|(key, _)| key.strip_prefix("CARGO_FEATURE_").map(str::to_string))
        .map(|feature| feature.to_lowercase().replace('_', "-"))
        .collect();
    features.sort();

    let features = if features.is_empty() {
        "none".to_string()
    } else {
        features.join(",")
    };

    println!("cargo:rustc-env=BUILD_FEATURES={}", features);
    println!("cargo:rerun-if-changed=build.rs");
}
