#![no_main]
use cdmf::security::{Permission, PermissionManager};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(permission) = input.parse::<Permission>() {
        let reparsed: Permission = permission
            .to_string()
            .parse()
            .expect("rendered permission parses");
        assert_eq!(reparsed, permission);
    }

    // Whole permission files: malformed lines are skipped, never fatal
    let manager = PermissionManager::new();
    let _ = manager.load_from_str(input);
    let _ = manager.to_config_string();
});
