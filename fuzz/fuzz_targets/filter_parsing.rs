#![no_main]
use cdmf::service::Filter;
use cdmf::Properties;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(filter) = Filter::parse(input) {
        // Rendering must parse back to the same filter
        let rendered = filter.to_string();
        let reparsed = Filter::parse(&rendered).expect("rendered filter parses");
        assert_eq!(reparsed, filter);

        let props = Properties::new()
            .with("service.interface", "IStore")
            .with("region", "eu-west")
            .with("ranking", 3i64);
        let _ = filter.matches(&props);
    }
});
