//! Wire-format contract tests for the chat protocol. The cases here
//! pin the exact JSON shapes the backend produces and expects; change
//! them only together with the server.
