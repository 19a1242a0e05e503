use std::sync::Arc;

use personalize::{
    DisplayContext, HttpGeolocationOracle, JsonFilePreferenceStore, PageType, PersonalizeConfig,
};

#[tokio::main]
async fn main() {
    env_logger::init();

    // Reads PERSONALIZE_PROJECT_UID. Without it, everything below serves default content.
    let personalizer = PersonalizeConfig::from_env()
        .to_personalizer()
        .expect("default edge URL is valid");

    let session = personalizer.session(
        Arc::new(HttpGeolocationOracle::new()),
        Arc::new(JsonFilePreferenceStore::new("currency-preference.json")),
    );

    // Detect the visitor's country (or restore their manual currency) and resolve variants.
    session.start().await;

    let snapshot = session.snapshot();
    println!("Currency: {}", snapshot.currency);
    println!("Detected country: {:?}", snapshot.detected_country);
    println!("Content scope: {:?}", snapshot.content_scope());

    // Once the page has rendered content for this epoch, report what was shown.
    let context = DisplayContext::new(PageType::Homepage, snapshot.render_epoch);
    if let Some(recording) = session.content_rendered(context) {
        let report = recording.await.expect("impression task should not panic");
        println!("Impressions recorded: {:?}", report.recorded);
    }
}
