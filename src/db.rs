use mongodb::{options::ClientOptions, Client, Database};
use std::env;

pub const SERVICES: &str = "Services";
pub const PURCHASES: &str = "Purchase_Book";

/// Connect to the managed cluster. Called once at startup; the returned
/// handle is cloned into every worker and lives for the whole process.
pub async fn connect() -> Database {
    let username = env::var("DATABASE_USERNAME").expect("DATABASE_USERNAME must be set");
    let password = env::var("DATABASE_PASSWORD").expect("DATABASE_PASSWORD must be set");

    let uri = format!(
        "mongodb+srv://{}:{}@cluster0.mongodb.net/?retryWrites=true&w=majority",
        username, password
    );

    let client_options = ClientOptions::parse(&uri)
        .await
        .expect("Failed to parse MongoDB connection string");

    let client = Client::with_options(client_options).expect("Failed to initialize MongoDB client");

    client.database("serviceDB")
}
