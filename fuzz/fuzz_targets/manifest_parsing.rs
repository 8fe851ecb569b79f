#![no_main]
use cdmf::ModuleManifest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(manifest) = ModuleManifest::parse(input) {
        // A validated manifest always yields parsed parts
        assert!(manifest.parsed_version().is_ok());
        assert!(manifest.provided().is_ok());
        assert!(manifest.parsed_dependencies().is_ok());
        assert!(manifest.parsed_permissions().is_ok());
    }
});
