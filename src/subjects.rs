use axum::extract::{Query, State};
use axum::Json;
use diesel::dsl::insert_into;
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::careers::load_career;
use crate::error::{db_error, not_found, ApiError};
use crate::model::{Career, EntityId, Subject, SubjectFilter, SubjectForm};
use crate::schema::subjects;
use crate::validate::ValidatedForm;
use crate::{AppState, SUBJECTS_TAG};

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(
            get_subject,
            create_subject,
            update_subject,
            delete_subject
        ))
        .routes(routes!(list_subjects))
}

/// The subject's semester has to exist in its career's plan.
fn semester_in_plan(career: &Career, semester: i32) -> Result<(), ApiError> {
    if semester > career.semester_count {
        return Err(ApiError::Validation(format!(
            "{} has {} semesters, semester {} does not exist",
            career.career_name, career.semester_count, semester
        )));
    }
    Ok(())
}

async fn check_semester(conn: &mut AsyncPgConnection, form: &SubjectForm) -> Result<(), ApiError> {
    let career = load_career(conn, form.career_id).await?;
    semester_in_plan(&career, form.semester)
}

/// Get subject
#[utoipa::path(get, path = "/api/subjects", responses((status = OK, body = Subject)), tag = SUBJECTS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Subject database id"),
)
)]
async fn get_subject(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<Json<Subject>, ApiError> {
    claims.authorize(&enforcer, "subject", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let subject = subjects::table
        .find(id)
        .select(Subject::as_select())
        .first(&mut conn)
        .await
        .map_err(not_found("get_subject", "Subject"))?;
    Ok(Json(subject))
}

/// List subjects, optionally by semester and career
#[utoipa::path(get, path = "/api/subjects/list", responses((status = OK, body = Vec<Subject>)), tag = SUBJECTS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("semester" = Option<i32>, Query, description = "Only subjects taught in this semester"),
    ("career_id" = Option<i32>, Query, description = "Only subjects of this career"),
)
)]
async fn list_subjects(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(filter): Query<SubjectFilter>,
) -> Result<Json<Vec<Subject>>, ApiError> {
    claims.authorize(&enforcer, "subject", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;

    let mut query = subjects::table
        .select(Subject::as_select())
        .order((subjects::semester, subjects::subject_name))
        .into_boxed();
    if let Some(semester) = filter.semester {
        query = query.filter(subjects::semester.eq(semester));
    }
    if let Some(career) = filter.career_id {
        query = query.filter(subjects::career_id.eq(career));
    }
    let rows = query
        .load(&mut conn)
        .await
        .map_err(db_error("list_subjects"))?;
    Ok(Json(rows))
}

/// Create subject
#[utoipa::path(post, path = "/api/subjects", request_body = SubjectForm, responses((status = OK, body = Subject)), tag = SUBJECTS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn create_subject(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    ValidatedForm(subject): ValidatedForm<SubjectForm>,
) -> Result<Json<Subject>, ApiError> {
    claims.authorize(&enforcer, "subject", "create")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    check_semester(&mut conn, &subject).await?;
    let created = insert_into(subjects::table)
        .values(&subject)
        .returning(Subject::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(db_error("create_subject"))?;
    Ok(Json(created))
}

/// Update subject
#[utoipa::path(put, path = "/api/subjects", request_body = SubjectForm, responses((status = OK, body = Subject)), tag = SUBJECTS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Subject database id"),
)
)]
async fn update_subject(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    ValidatedForm(subject): ValidatedForm<SubjectForm>,
) -> Result<Json<Subject>, ApiError> {
    claims.authorize(&enforcer, "subject", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    check_semester(&mut conn, &subject).await?;
    let updated = diesel::update(subjects::table.find(id))
        .set(&subject)
        .returning(Subject::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(not_found("update_subject", "Subject"))?;
    Ok(Json(updated))
}

/// Delete subject
#[utoipa::path(delete, path = "/api/subjects", responses((status = OK, body = ())), tag = SUBJECTS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Subject database id"),
)
)]
async fn delete_subject(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<(), ApiError> {
    claims.authorize(&enforcer, "subject", "delete")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    if diesel::delete(subjects::table.find(id))
        .execute(&mut conn)
        .await
        .map_err(db_error("delete_subject"))?
        == 0
    {
        Err(ApiError::NotFound("Subject"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn career(semester_count: i32) -> Career {
        Career {
            career_id: 1,
            career_name: "Computer Engineering".into(),
            semester_count,
        }
    }

    #[test]
    fn semesters_inside_the_plan_are_accepted() {
        assert!(semester_in_plan(&career(9), 1).is_ok());
        assert!(semester_in_plan(&career(9), 9).is_ok());
    }

    #[test]
    fn semesters_past_the_plan_are_rejected() {
        let err = semester_in_plan(&career(9), 10).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(
            err.to_string(),
            "Computer Engineering has 9 semesters, semester 10 does not exist"
        );
    }
}
