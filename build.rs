fn main() {
    // CoreBluetooth only lets a bare CLI binary scan when an Info.plist with
    // NSBluetoothAlwaysUsageDescription is embedded in the __TEXT,__info_plist
    // section. Without it the central manager stays "unauthorised" and the
    // capture session never leaves the scanning phase.
    //
    // CARGO_CFG_TARGET_OS is the target, so cross builds pick this up too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let dir = std::env::var("CARGO_MANIFEST_DIR")
            .expect("CARGO_MANIFEST_DIR must be set by Cargo");
        let plist = format!("{dir}/Info.plist");

        // ld … -sectcreate __TEXT __info_plist <plist>
        for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
            println!("cargo:rustc-link-arg-bins={arg}");
        }
        println!("cargo:rerun-if-changed=Info.plist");
    }
}
