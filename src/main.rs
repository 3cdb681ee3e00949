use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use futures::stream::StreamExt;
use log::{error, info};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Document};
use mongodb::options::{FindOptions, UpdateOptions};
use mongodb::Collection;
use serde_json::json;
use std::env;

mod auth;
mod db;
mod middleware;
mod models;

use middleware::AuthUser;
use models::{EmailQuery, Purchase, SearchQuery, Service, StatusUpdate};

#[derive(Clone)]
struct AppConfig {
    jwt_secret: String,
    production: bool,
}

async fn greeting() -> impl Responder {
    HttpResponse::Ok().body("Service Hub server is up and running. Happy to see you here!")
}

async fn issue_jwt(
    config: web::Data<AppConfig>,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    match auth::issue(&body, &config.jwt_secret) {
        Ok(token) => HttpResponse::Ok()
            .cookie(auth::session_cookie(token, config.production))
            .json(json!({ "success": true })),
        Err(e) => {
            error!("Jwt: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to issue token" }))
        }
    }
}

async fn logout(config: web::Data<AppConfig>) -> impl Responder {
    HttpResponse::Ok()
        .cookie(auth::clear_session_cookie(config.production))
        .json(json!({ "success": true }))
}

async fn add_service(
    services: web::Data<Collection<Service>>,
    _user: AuthUser,
    body: web::Json<Service>,
) -> impl Responder {
    match services.insert_one(body.into_inner(), None).await {
        Ok(result) => HttpResponse::Ok().json(json!({
            "acknowledged": true,
            "insertedId": result.inserted_id,
        })),
        Err(e) => {
            error!("Add service: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to add service" }))
        }
    }
}

fn purchase_dedupe_filter(email: &str, service_id: &str) -> Document {
    doc! { "currentUser.email": email, "serviceId": service_id }
}

async fn add_purchase(
    purchases: web::Data<Collection<Purchase>>,
    _user: AuthUser,
    body: web::Json<Purchase>,
) -> impl Responder {
    let purchase = body.into_inner();
    let filter = purchase_dedupe_filter(&purchase.current_user.email, &purchase.service_id);

    // Check-then-insert is not atomic; concurrent duplicate submissions can
    // both pass the check. Sequential requests are deduplicated.
    match purchases.find_one(filter, None).await {
        Ok(Some(_)) => {
            return HttpResponse::BadRequest()
                .json(json!({ "error": "You have already purchased this service" }));
        }
        Ok(None) => {}
        Err(e) => {
            error!("Add purchase: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to add purchase" }));
        }
    }

    match purchases.insert_one(purchase, None).await {
        Ok(result) => HttpResponse::Ok().json(json!({
            "acknowledged": true,
            "insertedId": result.inserted_id,
        })),
        Err(e) => {
            error!("Add purchase: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to add purchase" }))
        }
    }
}

fn banner_options() -> FindOptions {
    FindOptions::builder()
        .sort(doc! { "servicePrice": -1 })
        .limit(15)
        .projection(doc! { "serviceImage": 1 })
        .build()
}

async fn banner(services: web::Data<Collection<Service>>) -> impl Responder {
    // Projected documents no longer match the Service shape, so read them raw.
    let collection = services.clone_with_type::<Document>();
    match collection.find(None, banner_options()).await {
        Ok(cursor) => match drain(cursor).await {
            Ok(items) => HttpResponse::Ok().json(items),
            Err(e) => {
                error!("Banner: {}", e);
                HttpResponse::InternalServerError()
                    .json(json!({ "error": "Failed to get banner services" }))
            }
        },
        Err(e) => {
            error!("Banner: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to get banner services" }))
        }
    }
}

fn popular_options() -> FindOptions {
    // "Popular" is the cheapest four, matching the front-end contract.
    FindOptions::builder()
        .sort(doc! { "servicePrice": 1 })
        .limit(4)
        .build()
}

async fn popular_services(services: web::Data<Collection<Service>>) -> impl Responder {
    match services.find(None, popular_options()).await {
        Ok(cursor) => match drain(cursor).await {
            Ok(items) => HttpResponse::Ok().json(items),
            Err(e) => {
                error!("Popular services: {}", e);
                HttpResponse::InternalServerError()
                    .json(json!({ "error": "Failed to get popular services" }))
            }
        },
        Err(e) => {
            error!("Popular services: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to get popular services" }))
        }
    }
}

fn search_filter(search: Option<&str>) -> Option<Document> {
    // Case-insensitive substring match on the service name.
    search.map(|term| doc! { "serviceName": { "$regex": term, "$options": "i" } })
}

async fn all_services(
    services: web::Data<Collection<Service>>,
    query: web::Query<SearchQuery>,
) -> impl Responder {
    let filter = search_filter(query.search.as_deref());
    match services.find(filter, None).await {
        Ok(cursor) => match drain(cursor).await {
            Ok(items) => HttpResponse::Ok().json(items),
            Err(e) => {
                error!("All services: {}", e);
                HttpResponse::InternalServerError()
                    .json(json!({ "error": "Failed to get services" }))
            }
        },
        Err(e) => {
            error!("All services: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to get services" }))
        }
    }
}

async fn service_details(
    services: web::Data<Collection<Service>>,
    id: web::Path<String>,
) -> impl Responder {
    let object_id = match ObjectId::parse_str(id.into_inner()) {
        Ok(oid) => oid,
        Err(e) => {
            error!("Service details: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to get service details" }));
        }
    };

    match services.find_one(doc! { "_id": object_id }, None).await {
        // A miss is a successful null response, not a 404.
        Ok(service) => HttpResponse::Ok().json(service),
        Err(e) => {
            error!("Service details: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to get service details" }))
        }
    }
}

async fn manage_service(
    services: web::Data<Collection<Service>>,
    user: AuthUser,
    query: web::Query<EmailQuery>,
) -> impl Responder {
    if user.email != query.email {
        return HttpResponse::Forbidden().json(json!({ "error": "Forbidden Access" }));
    }

    match services
        .find(doc! { "serviceProvider.email": &query.email }, None)
        .await
    {
        Ok(cursor) => match drain(cursor).await {
            Ok(items) => HttpResponse::Ok().json(items),
            Err(e) => {
                error!("Manage service: {}", e);
                HttpResponse::InternalServerError()
                    .json(json!({ "error": "Failed to get your services" }))
            }
        },
        Err(e) => {
            error!("Manage service: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to get your services" }))
        }
    }
}

fn owned_service_filter(id: ObjectId, owner_email: &str) -> Document {
    doc! { "_id": id, "serviceProvider.email": owner_email }
}

async fn delete_service(
    services: web::Data<Collection<Service>>,
    user: AuthUser,
    id: web::Path<String>,
    query: web::Query<EmailQuery>,
) -> impl Responder {
    if user.email != query.email {
        return HttpResponse::Forbidden().json(json!({ "error": "Forbidden Access" }));
    }

    let object_id = match ObjectId::parse_str(id.into_inner()) {
        Ok(oid) => oid,
        Err(e) => {
            error!("Delete service: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to delete service" }));
        }
    };

    // The delete itself is constrained by the owner, so a valid session can
    // never remove another provider's listing by id alone.
    let filter = owned_service_filter(object_id, &user.email);
    match services.delete_one(filter, None).await {
        Ok(result) => HttpResponse::Ok().json(json!({
            "acknowledged": true,
            "deletedCount": result.deleted_count,
        })),
        Err(e) => {
            error!("Delete service: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to delete service" }))
        }
    }
}

fn service_set_update(service: &Service) -> Result<Document, mongodb::bson::ser::Error> {
    let mut replacement = service.clone();
    // _id is immutable; keep it out of the update document.
    replacement.id = None;
    let document = mongodb::bson::to_document(&replacement)?;
    Ok(doc! { "$set": document })
}

async fn update_service(
    services: web::Data<Collection<Service>>,
    user: AuthUser,
    id: web::Path<String>,
    body: web::Json<Service>,
) -> impl Responder {
    let service = body.into_inner();
    if user.email != service.service_provider.email {
        return HttpResponse::Forbidden().json(json!({ "error": "Forbidden Access" }));
    }

    let object_id = match ObjectId::parse_str(id.into_inner()) {
        Ok(oid) => oid,
        Err(e) => {
            error!("Update service: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to update service" }));
        }
    };

    let update = match service_set_update(&service) {
        Ok(update) => update,
        Err(e) => {
            error!("Update service: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to update service" }));
        }
    };

    // Upsert: an unknown id creates the document instead of failing.
    let options = UpdateOptions::builder().upsert(true).build();
    match services
        .update_one(doc! { "_id": object_id }, update, options)
        .await
    {
        Ok(result) => HttpResponse::Ok().json(json!({
            "acknowledged": true,
            "matchedCount": result.matched_count,
            "modifiedCount": result.modified_count,
            "upsertedId": result.upserted_id,
        })),
        Err(e) => {
            error!("Update service: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to update service" }))
        }
    }
}

async fn booked_service(
    purchases: web::Data<Collection<Purchase>>,
    user: AuthUser,
    query: web::Query<EmailQuery>,
) -> impl Responder {
    if user.email != query.email {
        return HttpResponse::Forbidden().json(json!({ "error": "Forbidden Access" }));
    }

    match purchases
        .find(doc! { "currentUser.email": &query.email }, None)
        .await
    {
        Ok(cursor) => match drain(cursor).await {
            Ok(items) => HttpResponse::Ok().json(items),
            Err(e) => {
                error!("Booked service: {}", e);
                HttpResponse::InternalServerError()
                    .json(json!({ "error": "Failed to get booked services" }))
            }
        },
        Err(e) => {
            error!("Booked service: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to get booked services" }))
        }
    }
}

async fn service_todo(
    purchases: web::Data<Collection<Purchase>>,
    user: AuthUser,
    query: web::Query<EmailQuery>,
) -> impl Responder {
    if user.email != query.email {
        return HttpResponse::Forbidden().json(json!({ "error": "Forbidden Access" }));
    }

    match purchases
        .find(doc! { "serviceProvider.email": &query.email }, None)
        .await
    {
        Ok(cursor) => match drain(cursor).await {
            Ok(items) => HttpResponse::Ok().json(items),
            Err(e) => {
                error!("Service todo: {}", e);
                HttpResponse::InternalServerError()
                    .json(json!({ "error": "Failed to get service to-do list" }))
            }
        },
        Err(e) => {
            error!("Service todo: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to get service to-do list" }))
        }
    }
}

// Requires a session. There is no per-document ownership filter, matching
// the granularity of the sibling purchase routes.
async fn update_purchase_status(
    purchases: web::Data<Collection<Purchase>>,
    _user: AuthUser,
    id: web::Path<String>,
    body: web::Json<StatusUpdate>,
) -> impl Responder {
    let object_id = match ObjectId::parse_str(id.into_inner()) {
        Ok(oid) => oid,
        Err(e) => {
            error!("Update status: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to update status" }));
        }
    };

    let update = doc! { "$set": { "serviceStatus": &body.service_status } };
    match purchases
        .update_one(doc! { "_id": object_id }, update, None)
        .await
    {
        Ok(result) => HttpResponse::Ok().json(json!({
            "acknowledged": true,
            "matchedCount": result.matched_count,
            "modifiedCount": result.modified_count,
            "upsertedId": result.upserted_id,
        })),
        Err(e) => {
            error!("Update status: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to update status" }))
        }
    }
}

async fn drain<T>(mut cursor: mongodb::Cursor<T>) -> Result<Vec<T>, mongodb::error::Error>
where
    T: serde::de::DeserializeOwned + Unpin + Send + Sync,
{
    let mut items = vec![];
    while let Some(item) = cursor.next().await {
        items.push(item?);
    }
    Ok(items)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok(); // Load environment variables from .env file
    env_logger::init();

    // Connect once; the collections are cloned into every worker.
    let database = db::connect().await;
    let services = database.collection::<Service>(db::SERVICES);
    let purchases = database.collection::<Purchase>(db::PURCHASES);

    let config = AppConfig {
        jwt_secret: env::var("ACCESS_TOKEN_SECRET").expect("ACCESS_TOKEN_SECRET must be set"),
        production: env::var("ENVIRONMENT")
            .map(|v| v == "production")
            .unwrap_or(false),
    };

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    info!("Starting server on port {}", port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin("http://localhost:5173")
            .allowed_origin("https://service-hub-client.web.app")
            .allow_any_method()
            .allow_any_header()
            .supports_credentials();

        App::new()
            .wrap(cors)
            .app_data(web::Data::new(services.clone()))
            .app_data(web::Data::new(purchases.clone()))
            .app_data(web::Data::new(config.clone()))
            // Public routes
            .route("/", web::get().to(greeting))
            .route("/jwt", web::post().to(issue_jwt))
            .route("/logout", web::post().to(logout))
            .route("/banner", web::get().to(banner))
            .route("/popular-services", web::get().to(popular_services))
            .route("/all-services", web::get().to(all_services))
            .route("/service-details/{id}", web::get().to(service_details))
            .service(
                web::scope("")
                    .wrap(middleware::AuthGate::new(config.jwt_secret.clone()))
                    .route("/add-service", web::post().to(add_service))
                    .route("/add-purchase", web::post().to(add_purchase))
                    .route("/manage-service", web::get().to(manage_service))
                    .route("/manage-service/{id}", web::delete().to(delete_service))
                    .route("/update-service/{id}", web::put().to(update_service))
                    .route("/booked-service", web::get().to(booked_service))
                    .route("/service-todo", web::get().to(service_todo))
                    .route(
                        "/service-todo-update-status/{id}",
                        web::patch().to(update_purchase_status),
                    ),
            )
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::cookie::Cookie;
    use actix_web::dev::Service as _;
    use actix_web::{http::StatusCode, test};
    use mongodb::bson::Bson;

    fn test_config() -> AppConfig {
        AppConfig {
            jwt_secret: "test-secret".into(),
            production: false,
        }
    }

    // A collection handle against a client that never connects; the driver is
    // lazy, so handlers that return before the store call never do I/O.
    async fn offline_collection<T>(name: &str) -> Collection<T> {
        let options = mongodb::options::ClientOptions::parse("mongodb://localhost:27017")
            .await
            .unwrap();
        let client = mongodb::Client::with_options(options).unwrap();
        client.database("serviceDB").collection::<T>(name)
    }

    fn token_for(email: &str) -> String {
        auth::issue(&json!({ "email": email }), "test-secret").unwrap()
    }

    #[actix_web::test]
    async fn greeting_is_public() {
        let app =
            test::init_service(App::new().route("/", web::get().to(greeting))).await;
        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn jwt_sets_session_cookie() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_config()))
                .route("/jwt", web::post().to(issue_jwt)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/jwt")
            .set_json(json!({ "email": "a@x.com" }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);

        let cookie = res
            .response()
            .cookies()
            .find(|c| c.name() == auth::TOKEN_COOKIE)
            .expect("session cookie set");
        let claims = auth::verify(cookie.value(), "test-secret").unwrap();
        assert_eq!(claims.email, "a@x.com");

        let body: serde_json::Value = test::read_body_json(res).await;
        assert_eq!(body, json!({ "success": true }));
    }

    #[actix_web::test]
    async fn logout_clears_session_cookie() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_config()))
                .route("/logout", web::post().to(logout)),
        )
        .await;

        let res = test::call_service(
            &app,
            test::TestRequest::post().uri("/logout").to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);

        let cookie = res
            .response()
            .cookies()
            .find(|c| c.name() == auth::TOKEN_COOKIE)
            .expect("removal cookie set");
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(actix_web::cookie::time::Duration::ZERO));
    }

    #[actix_web::test]
    async fn gated_route_rejected_before_reaching_the_store() {
        // No collection is registered: if the gate let the request through,
        // Data extraction would fail with 500 rather than 401.
        let app = test::init_service(App::new().service(
            web::scope("")
                .wrap(middleware::AuthGate::new("test-secret".into()))
                .route("/manage-service", web::get().to(manage_service)),
        ))
        .await;

        let req = test::TestRequest::get()
            .uri("/manage-service?email=a@x.com")
            .to_request();
        let err = app.call(req).await.err().expect("gate should reject");
        assert_eq!(
            err.as_response_error().status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[actix_web::test]
    async fn manage_service_forbids_identity_mismatch() {
        let services = offline_collection::<Service>(db::SERVICES).await;
        let app = test::init_service(
            App::new().app_data(web::Data::new(services)).service(
                web::scope("")
                    .wrap(middleware::AuthGate::new("test-secret".into()))
                    .route("/manage-service", web::get().to(manage_service)),
            ),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/manage-service?email=b@x.com")
            .cookie(Cookie::new(auth::TOKEN_COOKIE, token_for("a@x.com")))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn delete_service_forbids_identity_mismatch() {
        let services = offline_collection::<Service>(db::SERVICES).await;
        let app = test::init_service(
            App::new().app_data(web::Data::new(services)).service(
                web::scope("")
                    .wrap(middleware::AuthGate::new("test-secret".into()))
                    .route("/manage-service/{id}", web::delete().to(delete_service)),
            ),
        )
        .await;

        let req = test::TestRequest::delete()
            .uri("/manage-service/656a1b2c3d4e5f6a7b8c9d0e?email=b@x.com")
            .cookie(Cookie::new(auth::TOKEN_COOKIE, token_for("a@x.com")))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn update_service_forbids_foreign_provider_body() {
        let services = offline_collection::<Service>(db::SERVICES).await;
        let app = test::init_service(
            App::new().app_data(web::Data::new(services)).service(
                web::scope("")
                    .wrap(middleware::AuthGate::new("test-secret".into()))
                    .route("/update-service/{id}", web::put().to(update_service)),
            ),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/update-service/656a1b2c3d4e5f6a7b8c9d0e")
            .cookie(Cookie::new(auth::TOKEN_COOKIE, token_for("a@x.com")))
            .set_json(json!({
                "serviceName": "Deep Cleaning",
                "servicePrice": 49.0,
                "serviceImage": "https://img.example/clean.png",
                "serviceProvider": { "email": "b@x.com" }
            }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn service_details_bad_id_is_internal_failure() {
        let services = offline_collection::<Service>(db::SERVICES).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(services))
                .route("/service-details/{id}", web::get().to(service_details)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/service-details/not-an-object-id")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[::std::prelude::v1::test]
    fn banner_query_is_top_15_by_price_with_image_projection() {
        let options = banner_options();
        assert_eq!(options.limit, Some(15));
        assert_eq!(options.sort, Some(doc! { "servicePrice": -1 }));
        assert_eq!(options.projection, Some(doc! { "serviceImage": 1 }));
    }

    #[::std::prelude::v1::test]
    fn popular_query_is_bottom_4_by_price() {
        let options = popular_options();
        assert_eq!(options.limit, Some(4));
        assert_eq!(options.sort, Some(doc! { "servicePrice": 1 }));
        assert_eq!(options.projection, None);
    }

    #[::std::prelude::v1::test]
    fn search_filter_is_case_insensitive_substring() {
        assert_eq!(search_filter(None), None);
        assert_eq!(
            search_filter(Some("foo")),
            Some(doc! { "serviceName": { "$regex": "foo", "$options": "i" } })
        );
    }

    #[::std::prelude::v1::test]
    fn dedupe_filter_keys_on_buyer_and_service() {
        let filter = purchase_dedupe_filter("a@x.com", "abc123");
        assert_eq!(
            filter,
            doc! { "currentUser.email": "a@x.com", "serviceId": "abc123" }
        );
    }

    #[::std::prelude::v1::test]
    fn delete_filter_is_constrained_by_owner() {
        let id = ObjectId::parse_str("656a1b2c3d4e5f6a7b8c9d0e").unwrap();
        let filter = owned_service_filter(id, "a@x.com");
        assert_eq!(filter.get("_id"), Some(&Bson::ObjectId(id)));
        assert_eq!(
            filter.get("serviceProvider.email"),
            Some(&Bson::String("a@x.com".into()))
        );
    }

    #[::std::prelude::v1::test]
    fn update_document_never_touches_id() {
        let service = Service {
            id: Some(ObjectId::new()),
            service_name: "Deep Cleaning".into(),
            service_price: 49.0,
            service_image: "https://img.example/clean.png".into(),
            service_description: None,
            service_area: None,
            service_provider: models::Provider {
                email: "a@x.com".into(),
                name: Some("Ana".into()),
                image: None,
            },
        };

        let update = service_set_update(&service).unwrap();
        let set = update.get_document("$set").unwrap();
        assert!(!set.contains_key("_id"));
        assert_eq!(set.get_str("serviceName").unwrap(), "Deep Cleaning");
        assert_eq!(set.get_f64("servicePrice").unwrap(), 49.0);
    }
}
