#[macro_use]
extern crate rocket;

#[launch]
async fn rocket() -> _ {
    pretty_env_logger::init();
    info!("Bjorn CA version {} starting up...", env!("CARGO_PKG_VERSION"));

    let figment = bjorn_ca::config::Config::figment();
    let config = bjorn_ca::config::Config::from_figment(&figment)
        .expect("Unable to load configuration");
    let context = bjorn_ca::acme::Context::from_config(config).await
        .expect("Unable to set up the CA");
    info!("Serving provisioners: {}", context.provisioners.names().collect::<Vec<_>>().join(", "));

    bjorn_ca::acme::server(rocket::custom(figment), context)
        .attach(bjorn_ca::issuance::IssuanceFairing::default())
}
