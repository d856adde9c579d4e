//! Build script for ksfw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `ksfw version`.

fn main() {
    // Packagers can pin the nft binary at build time
    println!("cargo:rerun-if-env-changed=KSFW_SYSTEM_NFT_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
